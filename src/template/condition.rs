//! Conditional evaluation for resources.
//!
//! Each resource may carry a [`Condition`]; evaluation is a pure predicate
//! over the machine facts and resolve context with no side effects. Unknown
//! facts evaluate to false rather than erroring, so templates remain
//! portable across machines that lack certain facts.

use crate::facts::MachineFacts;
use crate::paths::{self, ResolveContext};
use crate::template::Condition;
use crate::template::merge::{selector_matches, wildcard_matches};

/// Whether a resource with the given condition applies on this machine.
///
/// A resource without a condition always applies. Every clause the
/// condition specifies must hold.
#[must_use]
pub fn should_apply(
    condition: Option<&Condition>,
    facts: &MachineFacts,
    resolve: &ResolveContext,
) -> bool {
    let Some(condition) = condition else {
        return true;
    };

    if condition.equals.is_some() || condition.matches.is_some() {
        // A comparison clause without a fact, or against an unknown fact,
        // cannot hold.
        let Some(value) = condition.fact.as_deref().and_then(|name| facts.get(name)) else {
            return false;
        };
        if let Some(expected) = &condition.equals
            && !expected.eq_ignore_ascii_case(&value)
        {
            return false;
        }
        if let Some(pattern) = &condition.matches
            && !wildcard_matches(pattern, &value, true)
        {
            return false;
        }
    }

    if let Some(address) = &condition.exists {
        let exists = paths::resolve(address, resolve)
            .ok()
            .and_then(|addr| addr.file_path().map(std::path::Path::exists))
            .unwrap_or(false);
        if !exists {
            return false;
        }
    }

    if let Some(tag) = &condition.tag
        && !facts.has_tag(tag)
    {
        return false;
    }

    if let Some(selector) = &condition.selector
        && !selector_matches(selector, facts)
    {
        return false;
    }

    true
}
