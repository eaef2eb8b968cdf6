use super::*;

const FIREFOX: &str = r#"
cask "firefox" do
  version "120.0.1"
  sha256 "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
  url "https://example.test/firefox-120.0.1.zip", verified: "example.test/"
  name "Mozilla Firefox"
  desc "Web browser"
  homepage "https://www.mozilla.org/firefox/"
  auto_updates true
  depends_on cask: "gpg-suite"
  conflicts_with cask: ["firefox-esr", "firefox-nightly"]

  app "Firefox.app"
  binary "Firefox.app/Contents/MacOS/firefox", target: "firefox"
  uninstall pkgutil: ["org.mozilla.firefox", "org.mozilla.updater"]
end
"#;

#[test]
fn evaluate_stanza_definition() {
    let definition = StanzaEvaluator
        .evaluate(FIREFOX)
        .expect("definition must evaluate");

    assert_eq!(definition.token, "firefox");
    assert_eq!(definition.version, "120.0.1");
    assert_eq!(
        definition.url.as_deref(),
        Some("https://example.test/firefox-120.0.1.zip")
    );
    assert_eq!(definition.names, vec!["Mozilla Firefox"]);
    assert!(definition.auto_updates);
    assert_eq!(definition.depends_on, vec!["gpg-suite"]);
    assert_eq!(
        definition.conflicts_with,
        vec!["firefox-esr", "firefox-nightly"]
    );
    assert_eq!(
        definition.artifacts,
        vec![
            ArtifactDescriptor::App {
                source: "Firefox.app".to_string(),
                target: None,
            },
            ArtifactDescriptor::Binary {
                source: "Firefox.app/Contents/MacOS/firefox".to_string(),
                target: Some("firefox".to_string()),
            },
            ArtifactDescriptor::Uninstall {
                pkgutil: vec![
                    "org.mozilla.firefox".to_string(),
                    "org.mozilla.updater".to_string()
                ],
            },
        ]
    );
    assert_eq!(
        definition.pkgutil_receipts(),
        vec!["org.mozilla.firefox", "org.mozilla.updater"]
    );
    assert_eq!(definition.source_text.as_deref(), Some(FIREFOX));
}

#[test]
fn evaluate_accepts_parenthesized_header_and_latest_symbol() {
    let source = "cask(\"nightly\") {\n  version :latest\n  sha256 :no_check\n  url \"https://example.test/nightly.dmg\"\n}\n";
    let definition = StanzaEvaluator
        .evaluate(source)
        .expect("definition must evaluate");

    assert_eq!(definition.token, "nightly");
    assert!(definition.is_latest());
    assert!(definition.sha256.is_none());
}

#[test]
fn evaluate_rejects_mismatched_block_terminator() {
    let source = "cask \"tool\" do\n  version \"1.0\"\n}\n";
    let err = StanzaEvaluator
        .evaluate(source)
        .expect_err("mismatched terminator must fail");
    assert!(err.to_string().contains("must end with 'end'"));
}

#[test]
fn evaluate_rejects_unknown_stanza_with_line_context() {
    let source = "cask \"tool\" do\n  version \"1.0\"\n  frobnicate \"x\"\nend\n";
    let err = StanzaEvaluator
        .evaluate(source)
        .expect_err("unknown stanza must fail");
    let rendered = format!("{err:#}");
    assert!(rendered.contains("body line 2"));
    assert!(rendered.contains("unknown stanza 'frobnicate'"));
}

#[test]
fn evaluate_rejects_duplicate_version() {
    let source = "cask \"tool\" do\n  version \"1.0\"\n  version \"2.0\"\nend\n";
    let err = StanzaEvaluator
        .evaluate(source)
        .expect_err("duplicate version must fail");
    assert!(format!("{err:#}").contains("may only appear once"));
}

#[test]
fn evaluate_requires_version() {
    let source = "cask \"tool\" do\n  url \"https://example.test/tool.zip\"\nend\n";
    let err = StanzaEvaluator
        .evaluate(source)
        .expect_err("missing version must fail");
    assert!(err.to_string().contains("missing a version stanza"));
}

#[test]
fn builder_rejects_self_conflict() {
    let mut builder = DefinitionBuilder::new("tool").expect("valid token");
    builder.version("1.0").expect("valid version");
    builder
        .conflicts_with_cask("tool")
        .expect("token is syntactically valid");
    let err = builder.build().expect_err("self conflict must fail");
    assert!(err.to_string().contains("conflicts with itself"));
}

#[test]
fn builder_rejects_escaping_artifact_paths() {
    let mut builder = DefinitionBuilder::new("tool").expect("valid token");
    let err = builder
        .artifact(ArtifactDescriptor::App {
            source: "../evil.app".to_string(),
            target: None,
        })
        .expect_err("parent traversal must fail");
    assert!(format!("{err:#}").contains("must not escape"));
}

#[test]
fn record_replay_matches_stanza_evaluation() {
    let evaluated = StanzaEvaluator
        .evaluate(FIREFOX)
        .expect("definition must evaluate");
    let record = CaskRecord::from(&evaluated);
    let json = serde_json::to_string(&record).expect("record must serialize");
    let replayed = CaskRecord::from_json_str(&json)
        .expect("record must parse")
        .replay()
        .expect("record must replay");

    assert!(replayed.loaded_from_api);
    assert_eq!(replayed.token, evaluated.token);
    assert_eq!(replayed.version, evaluated.version);
    assert_eq!(replayed.sha256, evaluated.sha256);
    assert_eq!(replayed.artifacts, evaluated.artifacts);
    assert_eq!(replayed.depends_on, evaluated.depends_on);
    assert_eq!(replayed.conflicts_with, evaluated.conflicts_with);
}

#[test]
fn caskfile_prefers_stanza_source() {
    let evaluated = StanzaEvaluator
        .evaluate(FIREFOX)
        .expect("definition must evaluate");
    let (extension, content) = evaluated.caskfile().expect("caskfile must render");
    assert_eq!(extension, "cask");
    assert_eq!(content, FIREFOX);

    let mut api_backed = evaluated.clone();
    api_backed.source_text = None;
    let (extension, content) = api_backed.caskfile().expect("caskfile must render");
    assert_eq!(extension, "json");
    assert!(content.contains("\"token\": \"firefox\""));
}

#[test]
fn token_validation_and_normalization() {
    assert_eq!(normalize_token("  Firefox "), "firefox");
    assert!(is_valid_token("font-fira-code"));
    assert!(is_valid_token("python@3.12"));
    assert!(!is_valid_token("-leading"));
    assert!(!is_valid_token("has space"));
    assert!(!is_valid_token(""));
}

#[test]
fn qualified_token_parses_three_segments_only() {
    let qualified = QualifiedToken::parse("Acme/Tools/Widget").expect("must parse");
    assert_eq!(qualified.tap.to_string(), "acme/tools");
    assert_eq!(qualified.token, "widget");
    assert_eq!(qualified.to_string(), "acme/tools/widget");

    assert!(QualifiedToken::parse("widget").is_none());
    assert!(QualifiedToken::parse("acme/widget").is_none());
    assert!(QualifiedToken::parse("a/b/c/d").is_none());
}

#[test]
fn migration_target_qualifies_relative_to_source() {
    let from = QualifiedToken::parse("caskpack/core/widget").expect("must parse");

    let tap_only = MigrationTarget::parse("acme/tools").expect("must parse");
    assert_eq!(tap_only.qualify(&from).to_string(), "acme/tools/widget");

    let tap_and_token = MigrationTarget::parse("acme/tools/gadget").expect("must parse");
    assert_eq!(tap_and_token.qualify(&from).to_string(), "acme/tools/gadget");

    let token_only = MigrationTarget::parse("widget-ng").expect("must parse");
    assert_eq!(token_only.qualify(&from).to_string(), "caskpack/core/widget-ng");

    assert!(MigrationTarget::parse("a/b/c/d").is_err());
}

#[test]
fn full_token_omits_default_tap() {
    let mut definition = StanzaEvaluator
        .evaluate(FIREFOX)
        .expect("definition must evaluate");
    definition.tap = Some(TapName::parse(DEFAULT_TAP).expect("default tap parses"));
    assert_eq!(definition.full_token(), "firefox");

    definition.tap = Some(TapName::parse("acme/tools").expect("tap parses"));
    assert_eq!(definition.full_token(), "acme/tools/firefox");
}

#[test]
fn archive_type_inference_ignores_query_strings() {
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/app.zip?download=1"),
        ArchiveType::Zip
    );
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/app.tar.gz#frag"),
        ArchiveType::TarGz
    );
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/Installer.pkg"),
        ArchiveType::Pkg
    );
    assert_eq!(
        ArchiveType::infer_from_url("https://example.test/tool"),
        ArchiveType::Raw
    );
}

#[test]
fn multiple_errors_lists_every_failure() {
    let err = CaskError::MultipleErrors {
        errors: vec![
            anyhow::anyhow!("alpha: download failed"),
            anyhow::anyhow!("beta: conflict"),
        ],
    };
    let rendered = err.to_string();
    assert!(rendered.starts_with("2 operations failed"));
    assert!(rendered.contains("alpha: download failed"));
    assert!(rendered.contains("beta: conflict"));
}
