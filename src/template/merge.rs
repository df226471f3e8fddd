//! Machine context and inheritance resolution.
//!
//! A shared/default template can be combined with machine-specific override
//! templates. Each override carries a [`MachineSelector`]; only overrides
//! whose selector matches the current machine facts participate in the
//! merge.
//!
//! Merge rules, per resource key: an override entry **fully replaces** the
//! default entry — no field-level blending, so a resource is never left
//! half-specified. Resources present on only one side are carried through.
//! List-valued sections (prerequisites, stages) concatenate default-first.
//! Two matching overrides defining the same key is a hard error; there is
//! no implicit precedence between overrides.
//!
//! Matching grammar: `*` and `?` wildcards, compiled to an anchored regex.
//! Hostname and OS matching is case-insensitive; tag matching is exact.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use regex::RegexBuilder;

use crate::error::EngineError;
use crate::facts::MachineFacts;
use crate::template::{MachineSelector, Template};

/// Audit of one merge: which overrides matched and what each contributed.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Names of override templates whose selector matched the machine.
    pub matched: Vec<String>,
    /// Resource keys replaced by an override: `(section/key, override name)`.
    pub replaced: Vec<(String, String)>,
    /// Resource keys added by an override: `(section/key, override name)`.
    pub added: Vec<(String, String)>,
}

impl MergeReport {
    /// One-line-per-decision description for debug logging.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "matched overrides: [{}]", self.matched.join(", "));
        for (key, origin) in &self.replaced {
            let _ = write!(out, "; {key} replaced by {origin}");
        }
        for (key, origin) in &self.added {
            let _ = write!(out, "; {key} added by {origin}");
        }
        out
    }
}

/// Whether a selector matches the given machine facts.
///
/// An empty selector matches every machine.
#[must_use]
pub fn selector_matches(selector: &MachineSelector, facts: &MachineFacts) -> bool {
    if let Some(pattern) = &selector.hostname
        && !wildcard_matches(pattern, &facts.hostname, true)
    {
        return false;
    }
    if let Some(os) = &selector.os
        && !os.eq_ignore_ascii_case(&facts.os.to_string())
    {
        return false;
    }
    selector.tags.iter().all(|tag| facts.has_tag(tag))
}

/// Match `value` against a wildcard pattern (`*` = any run, `?` = one char).
///
/// A pattern without wildcard characters degrades to a plain (optionally
/// case-insensitive) equality test.
pub(crate) fn wildcard_matches(pattern: &str, value: &str, case_insensitive: bool) -> bool {
    let escaped = regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".");
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(case_insensitive)
        .build()
        .is_ok_and(|re| re.is_match(value))
}

/// Merge a default template with machine override templates.
///
/// Produces a new template; neither input is mutated in place. The returned
/// [`MergeReport`] records every decision for auditing.
///
/// # Errors
///
/// Returns [`EngineError::MergeConflict`] when two matching overrides define
/// the same resource key.
pub fn merge(
    default: &Template,
    overrides: &[Template],
    facts: &MachineFacts,
) -> Result<(Template, MergeReport), EngineError> {
    let mut merged = default.clone();
    merged.selector = None;
    let mut report = MergeReport::default();

    // Qualified key → name of the override that claimed it, for conflict
    // detection across overrides.
    let mut claimed = BTreeMap::new();

    for override_template in overrides {
        let Some(selector) = &override_template.selector else {
            continue;
        };
        if !selector_matches(selector, facts) {
            continue;
        }
        let origin = override_template.display_name();
        report.matched.push(origin.clone());

        merge_section(
            "files",
            &mut merged.files,
            &override_template.files,
            &origin,
            &mut claimed,
            &mut report,
        )?;
        merge_section(
            "registry",
            &mut merged.registry,
            &override_template.registry,
            &origin,
            &mut claimed,
            &mut report,
        )?;
        merge_section(
            "applications",
            &mut merged.applications,
            &override_template.applications,
            &origin,
            &mut claimed,
            &mut report,
        )?;

        merged
            .prerequisites
            .extend(override_template.prerequisites.iter().cloned());
        merged
            .stages
            .prereqs
            .extend(override_template.stages.prereqs.iter().cloned());
        merged
            .stages
            .preupdate
            .extend(override_template.stages.preupdate.iter().cloned());
        merged
            .stages
            .postupdate
            .extend(override_template.stages.postupdate.iter().cloned());
        merged
            .stages
            .cleanup
            .extend(override_template.stages.cleanup.iter().cloned());
    }

    Ok((merged, report))
}

/// Apply one override section onto the merged section, recording decisions.
fn merge_section<T: Clone>(
    section: &str,
    merged: &mut BTreeMap<String, T>,
    overriding: &BTreeMap<String, T>,
    origin: &str,
    claimed: &mut BTreeMap<String, String>,
    report: &mut MergeReport,
) -> Result<(), EngineError> {
    for (key, entry) in overriding {
        let qualified = format!("{section}/{key}");
        if let Some(first) = claimed.get(&qualified) {
            return Err(EngineError::MergeConflict {
                key: qualified,
                first: first.clone(),
                second: origin.to_string(),
            });
        }
        claimed.insert(qualified.clone(), origin.to_string());
        if merged.insert(key.clone(), entry.clone()).is_some() {
            report.replaced.push((qualified, origin.to_string()));
        } else {
            report.added.push((qualified, origin.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::OsFamily;
    use crate::template::{FileEntry, Metadata, Prerequisite, StageStep};

    fn file_entry(path: &str) -> FileEntry {
        toml::from_str(&format!("path = \"{path}\"")).expect("valid file entry")
    }

    fn base_template() -> Template {
        let mut t = Template {
            metadata: Metadata {
                name: "base".to_string(),
                description: String::new(),
                version: "1".to_string(),
            },
            ..Template::default()
        };
        t.files.insert("conf".to_string(), file_entry("~/.config/app.conf"));
        t.files.insert("shell".to_string(), file_entry("~/.bashrc"));
        t
    }

    fn override_template(name: &str, selector: MachineSelector) -> Template {
        Template {
            metadata: Metadata {
                name: name.to_string(),
                description: String::new(),
                version: "1".to_string(),
            },
            selector: Some(selector),
            ..Template::default()
        }
    }

    fn facts() -> MachineFacts {
        MachineFacts::new("build-07", OsFamily::Linux).with_tag("ci")
    }

    // -----------------------------------------------------------------------
    // Wildcard grammar
    // -----------------------------------------------------------------------

    #[test]
    fn wildcard_star_matches_any_run() {
        assert!(wildcard_matches("build-*", "build-07", true));
        assert!(wildcard_matches("build-*", "build-", true));
        assert!(!wildcard_matches("build-*", "dev-07", true));
    }

    #[test]
    fn wildcard_question_matches_one_char() {
        assert!(wildcard_matches("build-0?", "build-07", true));
        assert!(!wildcard_matches("build-0?", "build-123", true));
    }

    #[test]
    fn wildcard_without_metacharacters_is_exact() {
        assert!(wildcard_matches("build-07", "build-07", true));
        assert!(!wildcard_matches("build-07", "build-078", true));
    }

    #[test]
    fn wildcard_is_anchored() {
        assert!(!wildcard_matches("uild", "build", true));
        assert!(!wildcard_matches("*uild", "build-07", true));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        assert!(wildcard_matches("a.b", "a.b", true));
        assert!(!wildcard_matches("a.b", "axb", true));
        assert!(wildcard_matches("a+b*", "a+b-c", true));
    }

    #[test]
    fn wildcard_case_sensitivity_flag() {
        assert!(wildcard_matches("BUILD-*", "build-07", true));
        assert!(!wildcard_matches("BUILD-*", "build-07", false));
    }

    // -----------------------------------------------------------------------
    // Selector matching
    // -----------------------------------------------------------------------

    #[test]
    fn empty_selector_matches_everything() {
        assert!(selector_matches(&MachineSelector::default(), &facts()));
    }

    #[test]
    fn selector_hostname_wildcard_case_insensitive() {
        let sel = MachineSelector {
            hostname: Some("BUILD-*".to_string()),
            ..MachineSelector::default()
        };
        assert!(selector_matches(&sel, &facts()));
    }

    #[test]
    fn selector_os_exact_case_insensitive() {
        let sel = MachineSelector {
            os: Some("Linux".to_string()),
            ..MachineSelector::default()
        };
        assert!(selector_matches(&sel, &facts()));
        let sel = MachineSelector {
            os: Some("windows".to_string()),
            ..MachineSelector::default()
        };
        assert!(!selector_matches(&sel, &facts()));
    }

    #[test]
    fn selector_requires_every_tag() {
        let sel = MachineSelector {
            tags: vec!["ci".to_string()],
            ..MachineSelector::default()
        };
        assert!(selector_matches(&sel, &facts()));
        let sel = MachineSelector {
            tags: vec!["ci".to_string(), "gpu".to_string()],
            ..MachineSelector::default()
        };
        assert!(!selector_matches(&sel, &facts()));
    }

    #[test]
    fn selector_all_clauses_must_hold() {
        let sel = MachineSelector {
            hostname: Some("build-*".to_string()),
            os: Some("windows".to_string()),
            tags: vec![],
        };
        assert!(!selector_matches(&sel, &facts()));
    }

    // -----------------------------------------------------------------------
    // Merge semantics
    // -----------------------------------------------------------------------

    #[test]
    fn override_replaces_resource_atomically() {
        let mut ov = override_template("ci-override", MachineSelector::default());
        ov.files.insert("conf".to_string(), file_entry("/etc/app/app.conf"));

        let (merged, report) = merge(&base_template(), &[ov], &facts()).unwrap();
        // The override's entry wins wholesale — never a field-level blend.
        assert_eq!(merged.files["conf"].path, "/etc/app/app.conf");
        assert_eq!(
            report.replaced,
            vec![("files/conf".to_string(), "ci-override".to_string())]
        );
    }

    #[test]
    fn resources_on_one_side_are_carried_through() {
        let mut ov = override_template("ov", MachineSelector::default());
        ov.files.insert("extra".to_string(), file_entry("~/.extra"));

        let (merged, report) = merge(&base_template(), &[ov], &facts()).unwrap();
        assert_eq!(merged.files.len(), 3);
        assert!(merged.files.contains_key("shell"));
        assert_eq!(
            report.added,
            vec![("files/extra".to_string(), "ov".to_string())]
        );
    }

    #[test]
    fn non_matching_override_is_ignored() {
        let mut ov = override_template(
            "other-machine",
            MachineSelector {
                hostname: Some("laptop-*".to_string()),
                ..MachineSelector::default()
            },
        );
        ov.files.insert("conf".to_string(), file_entry("/elsewhere"));

        let (merged, report) = merge(&base_template(), &[ov], &facts()).unwrap();
        assert_eq!(merged.files["conf"].path, "~/.config/app.conf");
        assert!(report.matched.is_empty());
    }

    #[test]
    fn conflicting_overrides_are_a_hard_error() {
        let mut a = override_template("a", MachineSelector::default());
        a.files.insert("conf".to_string(), file_entry("/a"));
        let mut b = override_template("b", MachineSelector::default());
        b.files.insert("conf".to_string(), file_entry("/b"));

        let err = merge(&base_template(), &[a, b], &facts()).unwrap_err();
        let EngineError::MergeConflict { key, first, second } = err else {
            panic!("expected merge conflict");
        };
        assert_eq!(key, "files/conf");
        assert_eq!(first, "a");
        assert_eq!(second, "b");
    }

    #[test]
    fn list_sections_concatenate_default_first() {
        let mut base = base_template();
        base.prerequisites.push(Prerequisite {
            kind: "application".to_string(),
            check: "default-check".to_string(),
            expected: None,
            on_missing: None,
        });
        base.stages.cleanup.push(StageStep {
            run: Some("default-cleanup".to_string()),
            script: None,
        });

        let mut ov = override_template("ov", MachineSelector::default());
        ov.prerequisites.push(Prerequisite {
            kind: "application".to_string(),
            check: "override-check".to_string(),
            expected: None,
            on_missing: None,
        });
        ov.stages.cleanup.push(StageStep {
            run: Some("override-cleanup".to_string()),
            script: None,
        });

        let (merged, _) = merge(&base, &[ov], &facts()).unwrap();
        let checks: Vec<&str> = merged.prerequisites.iter().map(|p| p.check.as_str()).collect();
        assert_eq!(checks, vec!["default-check", "override-check"]);
        let cleanup: Vec<&str> = merged
            .stages
            .cleanup
            .iter()
            .filter_map(|s| s.run.as_deref())
            .collect();
        assert_eq!(cleanup, vec!["default-cleanup", "override-cleanup"]);
    }

    #[test]
    fn merge_does_not_mutate_inputs() {
        let base = base_template();
        let mut ov = override_template("ov", MachineSelector::default());
        ov.files.insert("conf".to_string(), file_entry("/changed"));

        let (_, _) = merge(&base, &[ov.clone()], &facts()).unwrap();
        assert_eq!(base.files["conf"].path, "~/.config/app.conf");
        assert!(ov.selector.is_some());
    }

    #[test]
    fn report_describe_lists_decisions() {
        let mut ov = override_template("ov", MachineSelector::default());
        ov.files.insert("conf".to_string(), file_entry("/x"));
        let (_, report) = merge(&base_template(), &[ov], &facts()).unwrap();
        let text = report.describe();
        assert!(text.contains("ov"));
        assert!(text.contains("files/conf replaced by ov"));
    }
}
