//! The single-pass rewrite state machine.
//!
//! [`Rewriter::feed`] takes one input event and appends the events to write
//! in its place. It never looks ahead: everything it synthesizes is emitted
//! right before the element that made it necessary.

use std::collections::{BTreeSet, HashSet};

use quick_xml::events::{BytesStart, BytesText, Event};
use tracing::{debug, trace, warn};

use super::anchors::{self, Anchor, Anchors};
use super::attrs::{AttrSet, AttrSetError};
use super::error::{RewriteError, RewriteResult};
use super::rules::{self, Rules};
use super::{RewriteConfig, RewriteReport};

const ROOT_PATH: &str = "Module/FormModule";

/// Alerts removed together with their subtree.
const ELIDED_ALERTS: [&str; 2] = ["KERDEZ_ALERT", "UZEN_ALERT"];

pub(crate) struct Rewriter {
    rules: Rules,
    stack: Vec<String>,
    seen_paths: HashSet<String>,
    /// Depth inside an elided subtree; 0 when not skipping.
    skip_depth: usize,
    anchors: Anchors,
    module_name: Option<String>,
    needed_visual_attributes: BTreeSet<String>,
    declared_visual_attributes: HashSet<String>,
    required_parameters: Vec<String>,
    declared_parameters: HashSet<String>,
    report: RewriteReport,
}

impl Rewriter {
    pub(crate) fn new(config: &RewriteConfig) -> Self {
        Self {
            rules: Rules {
                scale: Some((config.cell_width, config.cell_height)),
            },
            stack: Vec::new(),
            seen_paths: HashSet::new(),
            skip_depth: 0,
            anchors: Anchors::default(),
            module_name: None,
            needed_visual_attributes: config.required_visual_attributes.iter().cloned().collect(),
            declared_visual_attributes: HashSet::new(),
            required_parameters: config.required_parameters.clone(),
            declared_parameters: HashSet::new(),
            report: RewriteReport::default(),
        }
    }

    /// Process one input event, pushing the output events onto `out`.
    ///
    /// `position` is the byte offset after the event, for error context.
    pub(crate) fn feed(
        &mut self,
        event: Event<'_>,
        position: u64,
        out: &mut Vec<Event<'static>>,
    ) -> RewriteResult<()> {
        if self.skip_depth > 0 {
            match event {
                Event::Start(_) => self.skip_depth += 1,
                Event::End(_) => self.skip_depth -= 1,
                _ => {}
            }
            return Ok(());
        }

        match event {
            Event::Start(start) => self.element(&start, false, position, out),
            Event::Empty(start) => self.element(&start, true, position, out),
            Event::End(end) => {
                self.stack.pop();
                out.push(Event::End(end.into_owned()));
                Ok(())
            }
            Event::Text(text) => {
                let raw = std::str::from_utf8(&text)
                    .map_err(|source| RewriteError::Encoding { position, source })?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    out.push(Event::Text(BytesText::from_escaped(trimmed.to_string())));
                }
                Ok(())
            }
            Event::Eof => Ok(()),
            other => {
                out.push(other.into_owned());
                Ok(())
            }
        }
    }

    /// Finish the document, reporting anything left unflushed.
    pub(crate) fn finish(self, position: u64) -> RewriteResult<RewriteReport> {
        if let Some(element) = self.stack.last() {
            return Err(RewriteError::Unclosed {
                position,
                element: element.clone(),
            });
        }

        let visual_attributes: Vec<String> = self.missing_visual_attributes();
        let parameters: Vec<String> = self.missing_parameters();
        if !visual_attributes.is_empty() || !parameters.is_empty() {
            return Err(RewriteError::Unflushed {
                visual_attributes,
                parameters,
            });
        }
        Ok(self.report)
    }

    fn element(
        &mut self,
        start: &BytesStart<'_>,
        empty: bool,
        position: u64,
        out: &mut Vec<Event<'static>>,
    ) -> RewriteResult<()> {
        let tag = std::str::from_utf8(start.name().as_ref())
            .map_err(|source| RewriteError::Encoding { position, source })?
            .to_string();
        let mut attrs = AttrSet::from_start(start).map_err(|err| match err {
            AttrSetError::Syntax(source) => RewriteError::Attribute { position, source },
            AttrSetError::Utf8(source) => RewriteError::Encoding { position, source },
        })?;

        let parent_path = self.stack.join("/");
        let form_child = parent_path == ROOT_PATH;

        if tag == "Alert" && form_child {
            let elided = attrs
                .get("Name")
                .filter(|name| ELIDED_ALERTS.iter().any(|alert| name == alert));
            if let Some(name) = elided {
                debug!(alert = %name, "eliding alert");
                self.report.elided.push(format!("Alert {name}"));
                if !empty {
                    self.skip_depth = 1;
                }
                return Ok(());
            }
        }

        let path = if parent_path.is_empty() {
            tag.clone()
        } else {
            format!("{parent_path}/{tag}")
        };
        if path == ROOT_PATH {
            self.module_name = attrs.get("Name").map(|n| n.into_owned());
        }
        if tag == "Coordinate" && rules::is_converted_coordinate(&attrs) {
            debug!("module already uses pixel coordinates, geometry scaling off");
            self.rules.scale = None;
        }

        if let Some(parent) = self.rules.apply(&tag, &mut attrs, self.module_name.as_deref()) {
            if self.report.unknown_parents.insert(parent.clone()) {
                debug!(%parent, tag = %tag, "unknown parent module");
            }
        }
        self.track(&tag, &attrs);

        if form_child {
            for anchor in self.anchors.on_child(&tag) {
                self.fire(anchor, out);
            }
        }
        self.seen_paths.insert(path);

        trace!(tag = %tag, attributes = attrs.len(), "element");
        let start = attrs.to_start(&tag);
        if empty {
            out.push(Event::Empty(start));
        } else {
            self.stack.push(tag);
            out.push(Event::Start(start));
        }
        Ok(())
    }

    fn track(&mut self, tag: &str, attrs: &AttrSet) {
        for name in rules::referenced_visual_attributes(attrs) {
            self.needed_visual_attributes.insert(name);
        }
        let Some(name) = attrs.get("Name").map(|n| n.into_owned()) else {
            return;
        };
        let declared = match tag {
            "VisualAttribute" => &mut self.declared_visual_attributes,
            "ModuleParameter" => &mut self.declared_parameters,
            _ => return,
        };
        if !declared.insert(name.clone()) {
            let entry = format!("{tag} {name}");
            if self.report.synthesized.contains(&entry) {
                warn!(tag, %name, "declared after being synthesized");
                self.report.duplicates.push(entry);
            }
        }
    }

    fn missing_visual_attributes(&self) -> Vec<String> {
        self.needed_visual_attributes
            .iter()
            .filter(|name| !self.declared_visual_attributes.contains(*name))
            .cloned()
            .collect()
    }

    fn missing_parameters(&self) -> Vec<String> {
        self.required_parameters
            .iter()
            .filter(|name| !self.declared_parameters.contains(*name))
            .cloned()
            .collect()
    }

    fn fire(&mut self, anchor: Anchor, out: &mut Vec<Event<'static>>) {
        match anchor {
            Anchor::Coordinate => {
                self.synthesize("Coordinate", anchors::coordinate(), out);
            }
            Anchor::Libraries if !self.seen_paths.contains(&format!("{ROOT_PATH}/AttachedLibrary")) => {
                self.synthesize("AttachedLibrary", anchors::attached_library(), out);
            }
            Anchor::Libraries => {}
            Anchor::Parameters => {
                for name in self.missing_parameters() {
                    self.synthesize("ModuleParameter", anchors::module_parameter(&name), out);
                    self.declared_parameters.insert(name);
                }
            }
            Anchor::VisualAttributes => {
                for name in self.missing_visual_attributes() {
                    self.synthesize("VisualAttribute", anchors::visual_attribute(&name), out);
                    self.declared_visual_attributes.insert(name);
                }
                self.needed_visual_attributes.clear();
            }
        }
    }

    fn synthesize(&mut self, tag: &str, attrs: AttrSet, out: &mut Vec<Event<'static>>) {
        let name = attrs.get("Name").map(|n| n.into_owned()).unwrap_or_default();
        debug!(tag, %name, "synthesizing");
        self.seen_paths.insert(format!("{ROOT_PATH}/{tag}"));
        self.report.synthesized.push(format!("{tag} {name}").trim_end().to_string());
        out.push(Event::Empty(attrs.to_start(tag)));
    }
}
