//! Deferred synthesis points among the children of `FormModule`.
//!
//! Each anchor watches the direct children of the form, in document order,
//! and resolves exactly once: either it fires (synthesized elements are
//! emitted before the child that triggered it) or the document turns out to
//! already contain what it would have added.

use super::attrs::AttrSet;

/// Children of `FormModule` before which missing parameters are declared.
const PARAMETER_ANCHORS: &[&str] = &[
    "LOV",
    "ProgramUnit",
    "PropertyClass",
    "RecordGroup",
    "VisualAttribute",
    "Window",
];

pub(crate) const LIBRARY: &str = "BR_PROCEDURE_LIB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Anchor {
    /// A canonical `Coordinate` as the first child.
    Coordinate,
    /// The procedure library, after coordinates and alerts.
    Libraries,
    /// Required module parameters.
    Parameters,
    /// Referenced but undeclared visual attributes.
    VisualAttributes,
}

/// What an anchor does when a given child of the form starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Emit synthesized elements before the child.
    Fire,
    /// Nothing to add, ever.
    Satisfied,
    /// Not yet.
    Wait,
}

impl Anchor {
    /// Emission order when several anchors resolve on the same child.
    pub(crate) const ALL: [Anchor; 4] = [
        Anchor::Coordinate,
        Anchor::Libraries,
        Anchor::Parameters,
        Anchor::VisualAttributes,
    ];

    pub(crate) fn resolve(self, child: &str) -> Resolution {
        match self {
            Anchor::Coordinate if child == "Coordinate" => Resolution::Satisfied,
            Anchor::Coordinate => Resolution::Fire,
            Anchor::Libraries => match child {
                "AttachedLibrary" => Resolution::Satisfied,
                "Coordinate" | "Alert" => Resolution::Wait,
                _ => Resolution::Fire,
            },
            Anchor::Parameters if PARAMETER_ANCHORS.contains(&child) => Resolution::Fire,
            Anchor::VisualAttributes if child == "Window" => Resolution::Fire,
            Anchor::Parameters | Anchor::VisualAttributes => Resolution::Wait,
        }
    }
}

/// The anchors still waiting to resolve.
#[derive(Debug, Clone)]
pub(crate) struct Anchors {
    pending: Vec<Anchor>,
}

impl Default for Anchors {
    fn default() -> Self {
        Self {
            pending: Anchor::ALL.to_vec(),
        }
    }
}

impl Anchors {
    /// Resolve pending anchors against the child `tag`, returning the ones
    /// that fire, in emission order.
    pub(crate) fn on_child(&mut self, tag: &str) -> Vec<Anchor> {
        let mut fired = Vec::new();
        self.pending.retain(|anchor| match anchor.resolve(tag) {
            Resolution::Fire => {
                fired.push(*anchor);
                false
            }
            Resolution::Satisfied => false,
            Resolution::Wait => true,
        });
        fired
    }
}

pub(crate) fn coordinate() -> AttrSet {
    super::rules::COORDINATE.iter().copied().collect()
}

pub(crate) fn attached_library() -> AttrSet {
    [
        ("Name", LIBRARY),
        ("LibraryLocation", LIBRARY),
        ("LibrarySource", "File"),
    ]
    .into_iter()
    .collect()
}

pub(crate) fn module_parameter(name: &str) -> AttrSet {
    [
        ("Name", name),
        ("ParentModule", "BR_FLIB"),
        ("ParentFilename", "BR_FLIB.fmb"),
        ("ParentModuleType", "12"),
        ("ParentName", name),
        ("ParentType", "13"),
    ]
    .into_iter()
    .collect()
}

pub(crate) fn visual_attribute(name: &str) -> AttrSet {
    [
        ("Name", name),
        ("ParentModule", "BR_FLIB"),
        ("ParentModuleType", "12"),
        ("ParentName", name),
        ("ParentType", "39"),
        ("DirtyInfo", "true"),
    ]
    .into_iter()
    .collect()
}
