//! Integration tests for the streaming XML rewrite.
//!
//! These tests run whole module documents through `FormsXmlProcessor` and
//! check the migrated output.

use std::collections::BTreeSet;

use forms2xml::rewrite::{FormsXmlProcessor, RewriteConfig, RewriteError};
use quick_xml::events::Event;
use quick_xml::Reader;

const ORDERS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Module version="101020002">
  <FormModule Name="ORDERS" ConsoleWindow="ROOT_WINDOW">
    <Coordinate CharacterCellWidth="5" CharacterCellHeight="14" CoordinateSystem="Character"/>
    <Alert Name="KERDEZ_ALERT" AlertMessage="Biztos?">
      <Trigger Name="KEY-COMMIT" TriggerText="null;"/>
    </Alert>
    <Alert Name="ERROR_ALERT" AlertMessage="Hiba"/>
    <Block Name="ORDERS" ParentModule="G_LIB">
      <Item Name="ORDER_ID" XPosition="2" YPosition="3" Width="10" Height="1" Prompt="Order" PromptFontName="Courier" ItemType="Check Box" WindowName="ROOT_WINDOW"/>
      <Item Name="NOTE" XPosition="0" Height="-3" ItemType="User Area" VisualAttributeName="NOTE_VA" FontName="Arial"/>
      <Item Name="LEGACY" ParentModule="LEGACY_LIB"/>
      <Trigger Name="WHEN-VALIDATE-ITEM" TriggerText="begin   &#10;  null;&#9;&#10;end;"/>
    </Block>
    <Canvas Name="C_STACK" CanvasType="Stacked" Width="20" Height="5" ViewportWidth="10" Bevel="Lowered"/>
    <Canvas Name="C_MAIN" CanvasType="Content" Width="80" WindowName="ROOT_WINDOW"/>
    <ProgramUnit Name="PU" ProgramUnitText="procedure p is  &#10;begin null; end;">
      <Comment>  kept   </Comment>
    </ProgramUnit>
    <VisualAttribute Name="ITEM_SELECT" ParentModule="G_LIB"/>
    <Window Name="ROOT_WINDOW" Width="80" Height="24" WindowStyle="Document" Title="Orders"/>
    <Window Name="W_DETAIL" Width="40"/>
  </FormModule>
</Module>
"#;

fn rewrite(input: &str) -> String {
    FormsXmlProcessor::default()
        .process_str(input)
        .map(|(out, _)| out)
        .unwrap()
}

/// The line of `out` holding the start tag of the element named `name`.
fn tag_line<'a>(out: &'a str, tag: &str, name: &str) -> &'a str {
    let needle = format!("<{tag} Name=\"{name}\"");
    out.lines()
        .find(|line| line.trim_start().starts_with(&needle))
        .unwrap_or_else(|| panic!("no {tag} {name} in\n{out}"))
}

fn element_names(xml: &str) -> BTreeSet<String> {
    let mut reader = Reader::from_str(xml);
    let mut names = BTreeSet::new();
    loop {
        match reader.read_event().unwrap() {
            Event::Start(e) | Event::Empty(e) => {
                names.insert(String::from_utf8(e.name().as_ref().to_vec()).unwrap());
            }
            Event::Eof => break,
            _ => {}
        }
    }
    names
}

#[test]
fn test_stacked_canvas_canonical() {
    let out = rewrite(ORDERS);
    assert_eq!(
        tag_line(&out, "Canvas", "C_STACK").trim(),
        r#"<Canvas Name="C_STACK" ParentType="4" ParentName="C_STCK_CONTENT" ParentModule="BR_FLIB" VisualAttributeName="NORMAL" ParentFilename="BR_FLIB.fmb" ParentModuleType="12"/>"#
    );
    assert_eq!(
        tag_line(&out, "Canvas", "C_MAIN").trim(),
        r#"<Canvas Name="C_MAIN"/>"#
    );
}

#[test]
fn test_prompt_visual_attribute_synthesized() {
    let config = RewriteConfig {
        required_visual_attributes: vec![],
        required_parameters: vec![],
        ..Default::default()
    };
    let input = r#"<Module>
  <FormModule Name="F">
    <Coordinate CoordinateSystem="Real" RealUnit="Pixel"/>
    <AttachedLibrary Name="BR_PROCEDURE_LIB"/>
    <Block Name="B" RecordVisualAttributeGroupName="SELECT">
      <Item Name="CUSTOMER" Prompt="Customer"/>
    </Block>
    <VisualAttribute Name="SELECT"/>
    <Window Name="W1" VisualAttributeName="SELECT"/>
  </FormModule>
</Module>"#;
    let (out, report) = FormsXmlProcessor::new(config).process_str(input).unwrap();

    assert!(tag_line(&out, "Item", "CUSTOMER").contains(r#"PromptVisualAttributeName="NORMAL_PROMPT""#));
    let synthesized = out.find(r#"<VisualAttribute Name="NORMAL_PROMPT""#).unwrap();
    assert!(synthesized < out.find("<Window").unwrap());
    assert!(synthesized > out.find(r#"<VisualAttribute Name="SELECT""#).unwrap());
    assert_eq!(report.synthesized, vec!["VisualAttribute NORMAL_PROMPT"]);
}

#[test]
fn test_geometry_scaled_per_axis() {
    let out = rewrite(ORDERS);
    let order_id = tag_line(&out, "Item", "ORDER_ID");
    assert!(order_id.contains(r#"XPosition="24""#), "{order_id}");
    assert!(order_id.contains(r#"YPosition="72""#));
    assert!(order_id.contains(r#"Width="120""#));
    assert!(order_id.contains(r#"Height="24""#));

    let note = tag_line(&out, "Item", "NOTE");
    assert!(note.contains(r#"XPosition="0""#), "{note}");
    assert!(note.contains(r#"Height="-3""#));

    assert!(tag_line(&out, "Window", "W_DETAIL").contains(r#"Width="480""#));
}

#[test]
fn test_converted_module_not_rescaled() {
    let input = r#"<Module>
  <FormModule Name="F">
    <Coordinate CharacterCellWidth="9" CharacterCellHeight="18" CoordinateSystem="Real" RealUnit="Pixel" DefaultFontScaling="false"/>
    <AttachedLibrary Name="BR_PROCEDURE_LIB"/>
    <Block Name="B"><Item Name="I" Width="120"/></Block>
    <Window Name="W1"/>
  </FormModule>
</Module>"#;
    let out = rewrite(input);
    assert!(tag_line(&out, "Item", "I").contains(r#"Width="120""#));
}

#[test]
fn test_root_window_replaced() {
    let out = rewrite(ORDERS);
    let window = tag_line(&out, "Window", "W_MAIN").trim();
    assert_eq!(
        window,
        r#"<Window Name="W_MAIN" Title="Orders" ParentType="41" ParentModule="BR_FLIB" ParentName="W_MAIN" ParentFilename="BR_FLIB.fmb" ParentModuleType="12" VisualAttributeName="NORMAL"/>"#
    );
    assert!(!out.contains("ROOT_WINDOW"));
    assert!(out.contains(r#"<FormModule Name="ORDERS" ConsoleWindow="W_MAIN">"#));
}

#[test]
fn test_attribute_rules() {
    let (out, report) = FormsXmlProcessor::default().process_str(ORDERS).unwrap();

    let order_id = tag_line(&out, "Item", "ORDER_ID");
    assert!(order_id.contains(r#"ItemType="Display Item""#));
    assert!(order_id.contains(r#"WindowName="W_MAIN""#));
    assert!(!order_id.contains("PromptFontName"));

    let note = tag_line(&out, "Item", "NOTE");
    assert!(note.contains(r#"ItemType="Text Item""#));
    assert!(!note.contains("FontName"));

    let block = tag_line(&out, "Block", "ORDERS");
    assert!(block.contains(r#"ParentModule="BR_FLIB" ParentFilename="BR_FLIB.fmb""#), "{block}");
    assert!(block.contains(r#"RecordVisualAttributeGroupName="SELECT""#));

    let select = tag_line(&out, "VisualAttribute", "SELECT");
    assert!(select.contains(r#"ParentType="39""#), "{select}");
    assert!(select.contains(r#"ParentName="SELECT""#));

    assert!(out.contains(r#"TriggerText="begin&#10;  null;&#10;end;""#), "{out}");
    assert!(out.contains(r#"ProgramUnitText="procedure p is&#10;begin null; end;""#));
    assert!(out.contains("<Comment>kept</Comment>"));

    assert_eq!(
        report.unknown_parents.into_iter().collect::<Vec<_>>(),
        vec!["LEGACY_LIB"]
    );
}

#[test]
fn test_anchor_order() {
    let (out, report) = FormsXmlProcessor::default().process_str(ORDERS).unwrap();

    let library = out.find(r#"<AttachedLibrary Name="BR_PROCEDURE_LIB""#).unwrap();
    assert!(out.find("<Coordinate").unwrap() < library);
    assert!(out.find(r#"<Alert Name="ERROR_ALERT""#).unwrap() < library);
    assert!(library < out.find("<Block").unwrap());

    let parameter = out.find(r#"<ModuleParameter Name="TORZSSZAM""#).unwrap();
    assert!(out.find(r#"<Canvas Name="C_MAIN""#).unwrap() < parameter);
    assert!(parameter < out.find("<ProgramUnit").unwrap());

    let first_window = out.find("<Window").unwrap();
    for name in ["NORMAL", "NORMAL_ITEM", "NORMAL_PROMPT", "NOTE_VA"] {
        let va = out
            .find(&format!(r#"<VisualAttribute Name="{name}""#))
            .unwrap_or_else(|| panic!("{name} missing"));
        assert!(va < first_window, "{name} after the first window");
    }
    assert_eq!(out.matches(r#"<VisualAttribute Name="SELECT""#).count(), 1);

    assert_eq!(
        report.synthesized,
        vec![
            "AttachedLibrary BR_PROCEDURE_LIB",
            "ModuleParameter TORZSSZAM",
            "ModuleParameter PRG_AZON",
            "ModuleParameter BAZON",
            "ModuleParameter DAZON",
            "VisualAttribute NORMAL",
            "VisualAttribute NORMAL_ITEM",
            "VisualAttribute NORMAL_PROMPT",
            "VisualAttribute NOTE_VA",
        ]
    );
    assert!(report.duplicates.is_empty());
}

#[test]
fn test_parameter_declared_after_anchor_reported() {
    let input = r#"<Module>
  <FormModule Name="F">
    <Coordinate CoordinateSystem="Real" RealUnit="Pixel"/>
    <AttachedLibrary Name="BR_PROCEDURE_LIB"/>
    <LOV Name="L1"/>
    <ModuleParameter Name="TORZSSZAM"/>
    <ModuleParameter Name="OWN_PARAM"/>
    <Window Name="W1"/>
  </FormModule>
</Module>"#;
    let (out, report) = FormsXmlProcessor::default().process_str(input).unwrap();

    assert_eq!(out.matches(r#"<ModuleParameter Name="TORZSSZAM""#).count(), 2);
    assert!(report.synthesized.contains(&"ModuleParameter TORZSSZAM".to_string()));
    assert_eq!(report.duplicates, vec!["ModuleParameter TORZSSZAM"]);
}

#[test]
fn test_missing_coordinate_synthesized() {
    let input = r#"<Module>
  <FormModule Name="F">
    <Block Name="B"/>
    <Window Name="W1"/>
  </FormModule>
</Module>"#;
    let (out, report) = FormsXmlProcessor::default().process_str(input).unwrap();
    assert!(out.find("<Coordinate").unwrap() < out.find("<AttachedLibrary").unwrap());
    assert!(out.contains(
        r#"<Coordinate CharacterCellWidth="9" CharacterCellHeight="18" CoordinateSystem="Real" RealUnit="Pixel" DefaultFontScaling="false"/>"#
    ));
    assert_eq!(report.synthesized[0], "Coordinate");
}

#[test]
fn test_alert_subtree_elided() {
    let (out, report) = FormsXmlProcessor::default().process_str(ORDERS).unwrap();
    assert!(!out.contains("KERDEZ_ALERT"));
    assert!(!out.contains("KEY-COMMIT"));
    assert!(out.contains(r#"<Alert Name="ERROR_ALERT" AlertMessage="Hiba"/>"#));
    assert_eq!(report.elided, vec!["Alert KERDEZ_ALERT"]);
}

#[test]
fn test_element_names_preserved() {
    let out = rewrite(ORDERS);
    let before = element_names(ORDERS);
    let after = element_names(&out);
    assert!(before.is_subset(&after), "lost {:?}", before.difference(&after).collect::<Vec<_>>());
    assert!(after.contains("ModuleParameter"));
    assert!(after.contains("AttachedLibrary"));
}

#[test]
fn test_idempotent() {
    let processor = FormsXmlProcessor::default();
    let (once, _) = processor.process_str(ORDERS).unwrap();
    let (twice, report) = processor.process_str(&once).unwrap();
    assert_eq!(once, twice);
    assert!(report.synthesized.is_empty());
    assert!(report.elided.is_empty());
}

#[test]
fn test_unflushed_is_reported() {
    let input = r#"<Module>
  <FormModule Name="F">
    <Coordinate CoordinateSystem="Real" RealUnit="Pixel"/>
    <Block Name="B"/>
  </FormModule>
</Module>"#;
    let err = FormsXmlProcessor::default().process_str(input).unwrap_err();
    match &err {
        RewriteError::Unflushed {
            visual_attributes,
            parameters,
        } => {
            assert_eq!(parameters, &vec!["TORZSSZAM", "PRG_AZON", "BAZON", "DAZON"]);
            assert!(visual_attributes.contains(&"NORMAL_PROMPT".to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.is_schema_violation());
}

#[test]
fn test_malformed_input_has_position() {
    let err = FormsXmlProcessor::default()
        .process_str("<Module><FormModule Name=\"F\"></Module>")
        .unwrap_err();
    match err {
        RewriteError::Malformed { position, .. } => assert!(position > 0),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_unknown_content_passes_through() {
    let input = r#"<?xml version="1.0"?>
<!-- exported by Forms Builder -->
<Module>
  <FormModule Name="F">
    <Coordinate CoordinateSystem="Real" RealUnit="Pixel"/>
    <AttachedLibrary Name="BR_PROCEDURE_LIB"/>
    <Block Name="B"><Gadget Flavour="odd" Width="abc"/></Block>
    <Window Name="W1"/>
  </FormModule>
</Module>"#;
    let out = rewrite(input);
    assert!(out.starts_with(r#"<?xml version="1.0"?>"#));
    assert!(out.contains("<!-- exported by Forms Builder -->"));
    assert!(out.contains(r#"<Gadget Flavour="odd" Width="abc"/>"#));
}

#[tokio::test]
async fn test_stream_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ORDERS.xml");
    std::fs::write(&path, ORDERS).unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let mut out = Vec::new();
    let report = FormsXmlProcessor::default()
        .process_stream(&mut out, tokio::io::BufReader::new(file))
        .await
        .unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), rewrite(ORDERS));
    assert_eq!(report.elided.len(), 1);
}
