//! Attribute rules applied to each start tag.
//!
//! Every rule is a plain function over the tag name and its [`AttrSet`];
//! [`Rules::apply`] runs them in their fixed order. Applying the rules to
//! their own output changes nothing.

use std::sync::LazyLock;

use regex::Regex;

use super::attrs::AttrSet;

/// Whitespace the Forms builder leaves before line breaks in PL/SQL bodies.
/// Blanks, literal or encoded, before an encoded line break in attribute text.
static TRAILING_BLANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\s|&#9;)+&#10;").unwrap());

pub(crate) const COORDINATE: [(&str, &str); 5] = [
    ("CharacterCellWidth", "9"),
    ("CharacterCellHeight", "18"),
    ("CoordinateSystem", "Real"),
    ("RealUnit", "Pixel"),
    ("DefaultFontScaling", "false"),
];

const STACKED_CANVAS: [(&str, &str); 6] = [
    ("ParentType", "4"),
    ("ParentName", "C_STCK_CONTENT"),
    ("ParentModule", "BR_FLIB"),
    ("VisualAttributeName", "NORMAL"),
    ("ParentFilename", "BR_FLIB.fmb"),
    ("ParentModuleType", "12"),
];

const ROOT_WINDOW: [(&str, &str); 7] = [
    ("ParentType", "41"),
    ("ParentModule", "BR_FLIB"),
    ("ParentName", "W_MAIN"),
    ("ParentFilename", "BR_FLIB.fmb"),
    ("ParentModuleType", "12"),
    ("VisualAttributeName", "NORMAL"),
    ("Name", "W_MAIN"),
];

const ROOT_WINDOW_STRIP: [&str; 14] = [
    "Height",
    "Width",
    "WindowStyle",
    "CloseAllowed",
    "MoveAllowed",
    "ResizeAllowed",
    "MinimizeAllowed",
    "InheritMenu",
    "Bevel",
    "FontName",
    "FontSize",
    "FontWeight",
    "FontStyle",
    "FontSpacing",
];

/// Deprecated libraries and their replacements: (module, filename).
const PARENT_REDIRECTS: [(&str, (&str, &str)); 2] = [
    ("G_LIB", ("BR_FLIB", "BR_FLIB.fmb")),
    ("CIM_LIB", ("BR_CIM_LIB", "BR_CIM_LIB.fmb")),
];

const ITEM_TYPES: [(&str, &str); 2] = [("Check Box", "Display Item"), ("User Area", "Text Item")];

const PROMPT_FONT: [&str; 5] = [
    "PromptFontName",
    "PromptFontSize",
    "PromptFontSpacing",
    "PromptFontStyle",
    "PromptFontWeight",
];

const FONT: [&str; 5] = ["FontName", "FontSize", "FontSpacing", "FontStyle", "FontWeight"];

pub(crate) const NORMAL_PROMPT: &str = "NORMAL_PROMPT";

/// Parent type of an element subclassed from a library, by tag.
fn parent_type(tag: &str) -> Option<&'static str> {
    match tag {
        "Trigger" => Some("37"),
        "Window" => Some("41"),
        "VisualAttribute" => Some("39"),
        _ => None,
    }
}

/// Whether a `Coordinate` already declares the pixel system.
pub(crate) fn is_converted_coordinate(attrs: &AttrSet) -> bool {
    attrs.is("CoordinateSystem", "Real") && attrs.is("RealUnit", "Pixel")
}

fn canvas(attrs: &mut AttrSet) {
    let stacked =
        attrs.is("CanvasType", "Stacked") || attrs.is("ParentName", "C_STCK_CONTENT");
    if stacked {
        attrs.retain(|key| key == "Name");
        for (key, value) in STACKED_CANVAS {
            attrs.set(key, value);
        }
    } else {
        attrs.retain(|key| key == "Name" || STACKED_CANVAS.iter().any(|(k, _)| *k == key));
    }
}

fn coordinate(attrs: &mut AttrSet) {
    for (key, value) in COORDINATE {
        attrs.update(key, value);
    }
}

fn is_geometry(key: &str) -> bool {
    key.ends_with("Position")
        || key.ends_with("Width")
        || key.ends_with("Height")
        || key == "DistanceBetweenRecords"
}

fn scale(attrs: &mut AttrSet, width: i64, height: i64) {
    let scaled: Vec<(String, String)> = attrs
        .iter()
        .filter(|(key, _)| is_geometry(key))
        .filter_map(|(key, raw)| {
            let value: i64 = raw.trim().parse().ok().filter(|v| *v > 0)?;
            let factor = if key.ends_with("Width") || key.ends_with("XPosition") {
                width
            } else {
                height
            };
            Some((key.to_string(), value.saturating_mul(factor).to_string()))
        })
        .collect();
    for (key, value) in scaled {
        attrs.set(&key, &value);
    }
}

/// Redirect deprecated library parents. Returns a parent module that is
/// neither this form nor a known library.
fn redirect_parent(tag: &str, attrs: &mut AttrSet, module_name: Option<&str>) -> Option<String> {
    let parent = attrs.get("ParentModule")?.into_owned();
    if Some(parent.as_str()) == module_name {
        return None;
    }
    if let Some((_, (module, filename))) = PARENT_REDIRECTS.iter().find(|(old, _)| *old == parent) {
        attrs.set("ParentModule", module);
        attrs.set("ParentFilename", filename);
        if let Some(parent_type) = parent_type(tag) {
            attrs.set("ParentType", parent_type);
        }
        return None;
    }
    let known = PARENT_REDIRECTS.iter().any(|(_, (module, _))| *module == parent);
    (!known).then_some(parent)
}

fn root_window(tag: &str, attrs: &mut AttrSet) {
    if tag == "Window" && attrs.is("Name", "ROOT_WINDOW") {
        for (key, value) in ROOT_WINDOW {
            attrs.set(key, value);
        }
        attrs.retain(|key| !ROOT_WINDOW_STRIP.contains(&key));
    }
    if attrs.is("WindowName", "ROOT_WINDOW") {
        attrs.set("WindowName", "W_MAIN");
    }
}

fn item_type(tag: &str, attrs: &mut AttrSet) {
    if tag != "Item" {
        return;
    }
    let Some(current) = attrs.get("ItemType").map(|v| v.into_owned()) else {
        return;
    };
    if let Some((_, supported)) = ITEM_TYPES.iter().find(|(old, _)| *old == current) {
        attrs.set("ItemType", supported);
    }
}

fn free_text(tag: &str, attrs: &mut AttrSet) {
    let key = match tag {
        "ProgramUnit" => "ProgramUnitText",
        "Trigger" => "TriggerText",
        _ => return,
    };
    let Some(raw) = attrs.raw(key) else {
        return;
    };
    let collapsed = match TRAILING_BLANKS.replace_all(raw, "&#10;") {
        std::borrow::Cow::Owned(collapsed) => collapsed,
        std::borrow::Cow::Borrowed(_) => return,
    };
    attrs.set_raw(key, collapsed);
}

fn visual_attribute_names(tag: &str, attrs: &mut AttrSet) {
    for key in ["RecordVisualAttributeGroupName", "VisualAttributeGroupName"] {
        if attrs.is(key, "ITEM_SELECT") {
            attrs.set(key, "SELECT");
        }
    }
    if tag == "Block" {
        attrs.update("RecordVisualAttributeGroupName", "SELECT");
    }
    if tag == "VisualAttribute" && attrs.is("Name", "ITEM_SELECT") {
        attrs.set("Name", "SELECT");
        attrs.set("ParentName", "SELECT");
    }
}

fn prompts(attrs: &mut AttrSet) {
    if attrs.contains("Prompt") {
        let defaulted = attrs
            .get("PromptVisualAttributeName")
            .map_or(true, |name| name == "DEFAULT");
        if defaulted {
            attrs.set("PromptVisualAttributeName", NORMAL_PROMPT);
            attrs.retain(|key| !PROMPT_FONT.contains(&key));
        }
    }
    if attrs.contains("VisualAttributeName") {
        attrs.retain(|key| !FONT.contains(&key));
    }
}

/// Visual attributes referenced by this tag.
pub(crate) fn referenced_visual_attributes(attrs: &AttrSet) -> Vec<String> {
    attrs
        .values()
        .filter(|(key, _)| {
            key.ends_with("VisualAttributeName") || key.ends_with("VisualAttributeGroupName")
        })
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && value != "DEFAULT")
        .collect()
}

/// The rule chain, configured for one document.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rules {
    /// Geometry factors; `None` once the document is known to be converted.
    pub(crate) scale: Option<(i64, i64)>,
}

impl Rules {
    /// Rewrite `attrs` of a `tag` start tag. Returns an unknown parent
    /// module it references, if any.
    pub(crate) fn apply(
        &self,
        tag: &str,
        attrs: &mut AttrSet,
        module_name: Option<&str>,
    ) -> Option<String> {
        match tag {
            "Canvas" => canvas(attrs),
            "Coordinate" => coordinate(attrs),
            "FormModule" => attrs.update("ConsoleWindow", "W_MAIN"),
            _ => {}
        }
        if let Some((width, height)) = self.scale {
            if !matches!(tag, "Coordinate" | "Module" | "FormModule") {
                scale(attrs, width, height);
            }
        }
        let unknown = redirect_parent(tag, attrs, module_name);
        root_window(tag, attrs);
        item_type(tag, attrs);
        free_text(tag, attrs);
        visual_attribute_names(tag, attrs);
        prompts(attrs);
        unknown
    }
}
