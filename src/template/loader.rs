//! Template loading and validation.
//!
//! Loading parses the TOML document; validation then checks the parsed
//! model and reports **every** problem found as one aggregated
//! [`SchemaViolations`] error. Templates are authored by end users, so
//! fail-fast validation would force a fix-reload loop per mistake.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, SchemaViolations, Violation};
use crate::template::{
    Action, InstallMode, OnMissing, PrereqKind, StageStep, Template, effective_state_path,
};

/// Load and validate a template document.
///
/// # Errors
///
/// Returns [`EngineError::Io`] when the file cannot be read and
/// [`EngineError::Schema`] when it cannot be parsed or fails validation;
/// validation failures list every violation found.
pub fn load(path: &Path) -> Result<Template, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut template: Template = toml::from_str(&content).map_err(|e| {
        SchemaViolations::new(vec![Violation::new(
            "document",
            path.display().to_string(),
            format!("TOML parse error: {e}"),
        )])
    })?;
    template.source = path.to_path_buf();

    let violations = validate(&template);
    if violations.is_empty() {
        Ok(template)
    } else {
        Err(SchemaViolations::new(violations).into())
    }
}

/// Load and validate a machine override template.
///
/// Override templates carry the same sections as a default template plus a
/// required `[selector]` table.
///
/// # Errors
///
/// Same contract as [`load`], with an additional violation when the
/// selector is absent.
pub fn load_override(path: &Path) -> Result<Template, EngineError> {
    let template = load(path)?;
    if template.selector.is_none() {
        return Err(SchemaViolations::new(vec![Violation::new(
            "selector",
            template.display_name(),
            "override template must declare a [selector] table",
        )])
        .into());
    }
    Ok(template)
}

/// Check a parsed template and collect every violation.
#[must_use]
pub fn validate(template: &Template) -> Vec<Violation> {
    let mut violations = Vec::new();

    validate_metadata(template, &mut violations);
    validate_prerequisites(template, &mut violations);
    validate_files(template, &mut violations);
    validate_registry(template, &mut violations);
    validate_applications(template, &mut violations);
    validate_state_paths(template, &mut violations);
    validate_stages(template, &mut violations);

    violations
}

fn validate_metadata(template: &Template, violations: &mut Vec<Violation>) {
    if template.metadata.name.trim().is_empty() {
        violations.push(Violation::new("metadata", "name", "required field is missing"));
    }
    if template.metadata.version.trim().is_empty() {
        violations.push(Violation::new("metadata", "version", "required field is missing"));
    }
}

fn validate_prerequisites(template: &Template, violations: &mut Vec<Violation>) {
    for (i, prereq) in template.prerequisites.iter().enumerate() {
        let item = format!("#{i}");
        if PrereqKind::parse(&prereq.kind).is_none() {
            violations.push(Violation::new(
                "prerequisites",
                item.clone(),
                format!(
                    "unknown kind '{}': must be one of application, registry, script",
                    prereq.kind
                ),
            ));
        }
        if prereq.check.trim().is_empty() {
            violations.push(Violation::new("prerequisites", item.clone(), "check is empty"));
        }
        if let Some(policy) = &prereq.on_missing
            && OnMissing::parse(policy).is_none()
        {
            violations.push(Violation::new(
                "prerequisites",
                item,
                format!(
                    "unknown on_missing '{policy}': must be one of warn, fail_backup, fail_restore"
                ),
            ));
        }
    }
}

fn validate_action(
    section: &str,
    key: &str,
    action: Option<&str>,
    violations: &mut Vec<Violation>,
) {
    if let Some(action) = action
        && Action::parse(action).is_none()
    {
        violations.push(Violation::new(
            section,
            key,
            format!("unknown action '{action}': must be one of backup, restore, sync"),
        ));
    }
}

fn validate_files(template: &Template, violations: &mut Vec<Violation>) {
    for (key, entry) in &template.files {
        if entry.path.trim().is_empty() {
            violations.push(Violation::new("files", key, "path is empty"));
        }
        validate_action("files", key, entry.action.as_deref(), violations);
    }
}

fn validate_registry(template: &Template, violations: &mut Vec<Violation>) {
    for (key, entry) in &template.registry {
        if !entry.path.trim_start().starts_with("reg://") {
            violations.push(Violation::new(
                "registry",
                key,
                "path must be a reg://HIVE/... address",
            ));
        }
        validate_action("registry", key, entry.action.as_deref(), violations);
    }
}

fn validate_applications(template: &Template, violations: &mut Vec<Violation>) {
    for (key, group) in &template.applications {
        if group.discovery.trim().is_empty() {
            violations.push(Violation::new("applications", key, "discovery command is empty"));
        }
        if let Some(mode) = &group.install_mode
            && InstallMode::parse(mode).is_none()
        {
            violations.push(Violation::new(
                "applications",
                key,
                format!("unknown install_mode '{mode}': must be per-item or list"),
            ));
        }
    }
}

/// Effective state paths must be unique and non-overlapping: one artifact
/// per resource, and no artifact may nest inside another's path.
fn validate_state_paths(template: &Template, violations: &mut Vec<Violation>) {
    let mut paths: BTreeMap<String, String> = BTreeMap::new();
    let mut check = |section: &str, key: &str, explicit: Option<&str>, out: &mut Vec<Violation>| {
        let path = effective_state_path(section, key, explicit);
        let qualified = format!("{section}/{key}");
        if let Some(other) = paths.get(&path) {
            out.push(Violation::new(
                section,
                key,
                format!("state_path '{path}' is already used by '{other}'"),
            ));
            return;
        }
        for (existing, owner) in &paths {
            if path.starts_with(&format!("{existing}/")) || existing.starts_with(&format!("{path}/"))
            {
                out.push(Violation::new(
                    section,
                    key,
                    format!("state_path '{path}' overlaps '{existing}' used by '{owner}'"),
                ));
            }
        }
        paths.insert(path, qualified);
    };

    for (key, entry) in &template.files {
        check("files", key, entry.state_path.as_deref(), violations);
    }
    for (key, entry) in &template.registry {
        check("registry", key, entry.state_path.as_deref(), violations);
    }
    for (key, group) in &template.applications {
        check("applications", key, group.state_path.as_deref(), violations);
    }
}

fn validate_stages(template: &Template, violations: &mut Vec<Violation>) {
    let template_dir = template.source.parent().map(Path::to_path_buf);
    let stages = [
        ("prereqs", &template.stages.prereqs),
        ("preupdate", &template.stages.preupdate),
        ("postupdate", &template.stages.postupdate),
        ("cleanup", &template.stages.cleanup),
    ];
    for (name, steps) in stages {
        for (i, step) in steps.iter().enumerate() {
            let item = format!("{name}[{i}]");
            match step {
                StageStep { run: Some(_), script: Some(_) } => {
                    violations.push(Violation::new(
                        "stages",
                        item,
                        "step declares both run and script; use exactly one",
                    ));
                }
                StageStep { run: None, script: None } => {
                    violations.push(Violation::new(
                        "stages",
                        item,
                        "step declares neither run nor script",
                    ));
                }
                StageStep { script: Some(script), .. } => {
                    if let Some(dir) = &template_dir
                        && !dir.join(script).is_file()
                    {
                        violations.push(Violation::new(
                            "stages",
                            item,
                            format!("script file '{script}' does not exist"),
                        ));
                    }
                }
                StageStep { run: Some(_), .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write template");
        path
    }

    const MINIMAL: &str = "[metadata]\nname = \"t\"\nversion = \"1\"\n";

    #[test]
    fn load_minimal_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "t.toml", MINIMAL);
        let t = load(&path).unwrap();
        assert_eq!(t.metadata.name, "t");
        assert_eq!(t.source, path);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn load_syntax_error_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "bad.toml", "[metadata\nname=");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    #[test]
    fn validation_aggregates_every_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            r#"
            [[prerequisites]]
            kind = "magic"
            check = ""
            on_missing = "explode"

            [files.a]
            path = ""
            action = "copy"

            [registry.b]
            path = "HKCU/Console"
            "#,
        );
        let err = load(&path).unwrap_err();
        let EngineError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        // metadata name + version, prereq kind + empty check + on_missing,
        // file path + action, registry address form.
        assert_eq!(schema.violations.len(), 8, "got: {schema}");
    }

    #[test]
    fn duplicate_state_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            &format!(
                "{MINIMAL}\n[files.a]\npath = \"~/a\"\nstate_path = \"shared.json\"\n\n\
                 [files.b]\npath = \"~/b\"\nstate_path = \"shared.json\"\n"
            ),
        );
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("already used by"));
    }

    #[test]
    fn nested_state_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            &format!(
                "{MINIMAL}\n[files.a]\npath = \"~/a\"\nstate_path = \"data\"\n\n\
                 [files.b]\npath = \"~/b\"\nstate_path = \"data/b.json\"\n"
            ),
        );
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn default_state_paths_do_not_collide_across_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            &format!(
                "{MINIMAL}\n[files.app]\npath = \"~/a\"\n\n\
                 [registry.app]\npath = \"reg://HKCU/App\"\n"
            ),
        );
        assert!(load(&path).is_ok());
    }

    #[test]
    fn stage_step_must_have_exactly_one_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            &format!("{MINIMAL}\n[stages]\ncleanup = [{{ }}]\n"),
        );
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("neither run nor script"));
    }

    #[test]
    fn stage_script_reference_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            "t.toml",
            &format!("{MINIMAL}\n[stages]\npreupdate = [{{ script = \"scripts/pre.sh\" }}]\n"),
        );
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        // Same template with the script present loads fine.
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/pre.sh"), "#!/bin/sh\n").unwrap();
        assert!(load(&path).is_ok());
    }

    #[test]
    fn override_requires_selector() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(dir.path(), "o.toml", MINIMAL);
        let err = load_override(&path).unwrap_err();
        assert!(err.to_string().contains("[selector]"));

        let path = write_template(
            dir.path(),
            "o2.toml",
            &format!("{MINIMAL}\n[selector]\nhostname = \"build-*\"\n"),
        );
        let t = load_override(&path).unwrap();
        assert_eq!(t.selector.unwrap().hostname.as_deref(), Some("build-*"));
    }
}
