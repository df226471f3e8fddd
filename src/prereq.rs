//! Prerequisite checking and gating.
//!
//! Checks run concurrently (they are read-only), then gate synchronously:
//! a failed check routed `fail_backup`/`fail_restore` aborts the whole
//! invocation **before any resource mutation** when the current operation
//! matches; `warn` checks are recorded and execution continues.

use rayon::prelude::*;

use crate::context::{Operation, RunContext};
use crate::error::EngineError;
use crate::state::registry::ValueData;
use crate::paths;
use crate::template::{OnMissing, PrereqKind, Prerequisite};

/// The outcome of one prerequisite check.
#[derive(Debug, Clone)]
pub struct PrereqOutcome {
    /// The check expression.
    pub check: String,
    /// The failure policy declared for the prerequisite.
    pub policy: OnMissing,
    /// Whether the check passed.
    pub passed: bool,
    /// Human-readable detail (actual output, missing value, error).
    pub detail: String,
}

/// All prerequisite outcomes of one run, partitioned by routing.
#[derive(Debug, Default)]
pub struct PrereqReport {
    /// Checks that passed.
    pub passed: Vec<PrereqOutcome>,
    /// Failed checks with the `warn` policy.
    pub warnings: Vec<PrereqOutcome>,
    /// Failed checks with a `fail_*` policy.
    pub failures: Vec<PrereqOutcome>,
}

impl PrereqReport {
    fn partition(outcomes: Vec<PrereqOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            if outcome.passed {
                report.passed.push(outcome);
            } else if outcome.policy == OnMissing::Warn {
                report.warnings.push(outcome);
            } else {
                report.failures.push(outcome);
            }
        }
        report
    }
}

/// Run every prerequisite check concurrently and partition the outcomes.
#[must_use]
pub fn check_all(prereqs: &[Prerequisite], ctx: &RunContext) -> PrereqReport {
    let outcomes: Vec<PrereqOutcome> = prereqs
        .par_iter()
        .map(|prereq| check_one(prereq, ctx))
        .collect();
    PrereqReport::partition(outcomes)
}

/// Abort when a hard failure applies to the current operation.
///
/// A `fail_backup` failure gates only backup runs and a `fail_restore`
/// failure only restore runs; both are still recorded in the report either
/// way.
///
/// # Errors
///
/// Returns [`EngineError::PrerequisiteFailed`] for the first gating failure.
pub fn gate(report: &PrereqReport, operation: Operation) -> Result<(), EngineError> {
    let gating = report.failures.iter().find(|outcome| {
        matches!(
            (outcome.policy, operation),
            (OnMissing::FailBackup, Operation::Backup)
                | (OnMissing::FailRestore, Operation::Restore)
        )
    });
    match gating {
        Some(outcome) => Err(EngineError::PrerequisiteFailed {
            check: outcome.check.clone(),
            detail: outcome.detail.clone(),
        }),
        None => Ok(()),
    }
}

fn check_one(prereq: &Prerequisite, ctx: &RunContext) -> PrereqOutcome {
    let (passed, detail) = match prereq.kind() {
        Some(PrereqKind::Application) => check_application(prereq, ctx),
        Some(PrereqKind::Script) => check_command(prereq, ctx),
        Some(PrereqKind::Registry) => check_registry(prereq, ctx),
        None => (false, format!("unknown prerequisite kind '{}'", prereq.kind)),
    };
    PrereqOutcome {
        check: prereq.check.clone(),
        policy: prereq.policy(),
        passed,
        detail,
    }
}

/// Application check: a bare program name with no expectation is a PATH
/// lookup; anything else runs as a command.
fn check_application(prereq: &Prerequisite, ctx: &RunContext) -> (bool, String) {
    let check = prereq.check.trim();
    if prereq.expected.is_none() && !check.contains(char::is_whitespace) {
        let found = ctx.executor.which(check);
        let detail = if found {
            format!("'{check}' found on PATH")
        } else {
            format!("'{check}' not found on PATH")
        };
        return (found, detail);
    }
    check_command(prereq, ctx)
}

/// Run the check command and compare its output against `expected`.
fn check_command(prereq: &Prerequisite, ctx: &RunContext) -> (bool, String) {
    match ctx.executor.run_shell(&prereq.check, ctx.timeout) {
        Ok(result) if result.success => {
            let output = result.stdout.trim();
            if expectation_met(prereq.expected.as_deref(), output) {
                (true, output.to_string())
            } else {
                (
                    false,
                    format!(
                        "output '{output}' does not match expected '{}'",
                        prereq.expected.as_deref().unwrap_or("")
                    ),
                )
            }
        }
        Ok(result) => (
            false,
            format!("exited with {:?}: {}", result.code, result.stderr.trim()),
        ),
        Err(e) => (false, e.to_string()),
    }
}

/// Registry check: `check` addresses a value (`reg://HIVE/key/value`);
/// the value must exist and, when `expected` is set, match it.
fn check_registry(prereq: &Prerequisite, ctx: &RunContext) -> (bool, String) {
    let address = match paths::resolve(&prereq.check, &ctx.resolve) {
        Ok(resolved) => match resolved.registry().cloned() {
            Some(address) => address,
            None => return (false, "not a hierarchical key address".to_string()),
        },
        Err(e) => return (false, e.to_string()),
    };
    let (Some(name), Some(parent)) = (address.leaf().map(ToString::to_string), address.parent())
    else {
        return (false, "address must name a value under a key".to_string());
    };
    match ctx.key_store.read_value(&parent, &name) {
        Ok(Some(value)) => {
            let actual = display_value(&value);
            if expectation_met(prereq.expected.as_deref(), &actual) {
                (true, actual)
            } else {
                (
                    false,
                    format!(
                        "value '{actual}' does not match expected '{}'",
                        prereq.expected.as_deref().unwrap_or("")
                    ),
                )
            }
        }
        Ok(None) => (false, format!("value '{name}' not found under {parent}")),
        Err(e) => (false, e.to_string()),
    }
}

/// Exact match first, anchored regex as the fallback.
fn expectation_met(expected: Option<&str>, actual: &str) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    if expected == actual {
        return true;
    }
    regex::Regex::new(&format!("^(?:{expected})$"))
        .map(|re| re.is_match(actual))
        .unwrap_or(false)
}

fn display_value(value: &ValueData) -> String {
    match value {
        ValueData::String(s) => s.clone(),
        ValueData::Number(n) => n.to_string(),
        ValueData::List(items) => items.join(","),
        ValueData::Binary(bytes) => {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::paths::RegistryAddress;
    use crate::state::registry::{KeyTree, MemoryKeyStore};
    use crate::state::test_helpers::{MockExecutor, context_builder};

    fn prereq(kind: &str, check: &str, expected: Option<&str>, policy: Option<&str>) -> Prerequisite {
        Prerequisite {
            kind: kind.to_string(),
            check: check.to_string(),
            expected: expected.map(ToString::to_string),
            on_missing: policy.map(ToString::to_string),
        }
    }

    // -----------------------------------------------------------------------
    // Expectation matching
    // -----------------------------------------------------------------------

    #[test]
    fn expectation_none_always_met() {
        assert!(expectation_met(None, "anything"));
    }

    #[test]
    fn expectation_exact_match_first() {
        assert!(expectation_met(Some("git version 2.43"), "git version 2.43"));
        assert!(!expectation_met(Some("git version 2.43"), "git version 2.44"));
    }

    #[test]
    fn expectation_regex_fallback_is_anchored() {
        assert!(expectation_met(Some("git version .*"), "git version 2.43.0"));
        assert!(!expectation_met(Some("version"), "git version 2.43.0"));
    }

    #[test]
    fn expectation_invalid_regex_is_not_met() {
        assert!(!expectation_met(Some("(unclosed"), "(unclosed group"));
    }

    // -----------------------------------------------------------------------
    // Check kinds
    // -----------------------------------------------------------------------

    #[test]
    fn script_check_compares_output() {
        let ctx = context_builder()
            .executor(Arc::new(MockExecutor::ok("ok\n")))
            .build();
        let report = check_all(&[prereq("script", "./check.sh", Some("ok"), None)], &ctx);
        assert_eq!(report.passed.len(), 1);
    }

    #[test]
    fn application_check_runs_command_with_expected() {
        let executor = Arc::new(MockExecutor::ok("git version 2.43.0\n"));
        let ctx = context_builder()
            .executor(Arc::clone(&executor) as Arc<dyn crate::exec::Executor>)
            .build();
        let report = check_all(
            &[prereq("application", "git --version", Some("git version .*"), None)],
            &ctx,
        );
        assert_eq!(report.passed.len(), 1);
        assert_eq!(executor.calls(), vec!["git --version"]);
    }

    #[test]
    fn application_bare_name_uses_path_lookup() {
        // MockExecutor::which always returns false.
        let ctx = context_builder().build();
        let report = check_all(&[prereq("application", "git", None, None)], &ctx);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].detail.contains("not found on PATH"));
    }

    #[test]
    fn failed_command_reports_exit_detail() {
        let ctx = context_builder()
            .executor(Arc::new(MockExecutor::with_responses(vec![(
                false,
                String::new(),
            )])))
            .build();
        let report = check_all(&[prereq("script", "./broken.sh", None, None)], &ctx);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].detail.contains("exited with"));
    }

    #[test]
    fn registry_check_reads_value_through_store() {
        let store = Arc::new(MemoryKeyStore::default());
        let mut tree = KeyTree::default();
        tree.values.insert(
            "Version".to_string(),
            ValueData::String("3.1".to_string()),
        );
        store.seed(&RegistryAddress::parse("HKLM/Software/App").unwrap(), tree);

        let ctx = context_builder().key_store(store).build();
        let report = check_all(
            &[prereq("registry", "reg://HKLM/Software/App/Version", Some("3.*"), None)],
            &ctx,
        );
        assert_eq!(report.passed.len(), 1);
        assert_eq!(report.passed[0].detail, "3.1");
    }

    #[test]
    fn registry_check_missing_value_fails() {
        let ctx = context_builder().build();
        let report = check_all(
            &[prereq("registry", "reg://HKLM/Software/App/Version", None, None)],
            &ctx,
        );
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].detail.contains("not found"));
    }

    #[test]
    fn registry_check_hive_root_is_invalid() {
        let ctx = context_builder().build();
        let report = check_all(&[prereq("registry", "reg://HKLM", None, None)], &ctx);
        assert_eq!(report.warnings.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Partitioning and gating
    // -----------------------------------------------------------------------

    #[test]
    fn report_partitions_by_policy() {
        // Checks run concurrently, so every scripted response fails: the
        // partition is then decided purely by each prerequisite's policy.
        let executor = Arc::new(MockExecutor::with_responses(vec![
            (false, String::new()),
            (false, String::new()),
            (false, String::new()),
        ]));
        let ctx = context_builder()
            .executor(executor as Arc<dyn crate::exec::Executor>)
            .build();
        let report = check_all(
            &[
                prereq("script", "a", None, None),
                prereq("script", "b", None, Some("warn")),
                prereq("script", "c", None, Some("fail_backup")),
            ],
            &ctx,
        );
        assert!(report.passed.is_empty());
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].check, "c");
    }

    #[test]
    fn gate_aborts_matching_operation_only() {
        let report = PrereqReport {
            passed: vec![],
            warnings: vec![],
            failures: vec![PrereqOutcome {
                check: "git".to_string(),
                policy: OnMissing::FailBackup,
                passed: false,
                detail: "not found".to_string(),
            }],
        };
        let err = gate(&report, Operation::Backup).unwrap_err();
        assert!(matches!(err, EngineError::PrerequisiteFailed { .. }));
        // The same failure does not gate a restore.
        assert!(gate(&report, Operation::Restore).is_ok());
    }

    #[test]
    fn gate_ignores_warnings() {
        let report = PrereqReport {
            passed: vec![],
            warnings: vec![PrereqOutcome {
                check: "x".to_string(),
                policy: OnMissing::Warn,
                passed: false,
                detail: String::new(),
            }],
            failures: vec![],
        };
        assert!(gate(&report, Operation::Backup).is_ok());
        assert!(gate(&report, Operation::Restore).is_ok());
    }
}
