//! Resource-name helpers.
//!
//! Names follow the `projects/{p}/instances/{i}/databases/{d}` hierarchy.
//! Operation names hang off their parent as `{parent}/operations/{id}`.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;

/// Builds `projects/{project_id}`, percent-decoding ids that arrive encoded
/// (e.g. projects nested under an organization).
#[must_use]
pub fn project_name(project_id: &str) -> String {
    let name = format!("projects/{project_id}");
    match percent_decode_str(&name).decode_utf8() {
        Ok(Cow::Owned(decoded)) => decoded,
        Ok(Cow::Borrowed(_)) => name,
        Err(e) => {
            tracing::debug!(project_id, error = %e, "project id is not valid percent-encoded UTF-8");
            name
        }
    }
}

/// Builds the name of an operation running under `database`.
#[must_use]
pub fn database_operation_name(database: &str, operation_id: &str) -> String {
    format!("{database}/operations/{operation_id}")
}

/// Builds `{instance}/databases/{database_id}`.
#[must_use]
pub fn database_name(instance: &str, database_id: &str) -> String {
    format!("{instance}/databases/{database_id}")
}

/// Builds `{instance}/backups/{backup_id}`.
#[must_use]
pub fn backup_name(instance: &str, backup_id: &str) -> String {
    format!("{instance}/backups/{backup_id}")
}

/// Returns the longest `projects/*/instances/*/databases/*` or
/// `projects/*/instances/*` prefix of `resource`, if there is one.
#[must_use]
pub fn routing_prefix(resource: &str) -> Option<&str> {
    let mut segments = resource.split('/');
    let mut end = 0usize;
    let mut matched = None;
    for (kind, terminal) in [("projects", false), ("instances", true), ("databases", true)] {
        let (Some(k), Some(id)) = (segments.next(), segments.next()) else {
            break;
        };
        if k != kind || id.is_empty() {
            break;
        }
        // `+ 2` accounts for the two separators around the collection id.
        end += k.len() + id.len() + if end == 0 { 1 } else { 2 };
        if terminal {
            matched = Some(&resource[..end]);
        }
    }
    matched
}

/// Extracts the database id from a `CREATE DATABASE` statement.
///
/// Accepts back-quoted and bare identifiers, case-insensitively.
#[must_use]
pub fn database_id_from_create_statement(statement: &str) -> Option<&str> {
    let trimmed = statement.trim();
    let prefix = "CREATE DATABASE";
    let head = trimmed.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = trimmed[prefix.len()..].trim();
    let id = rest
        .strip_prefix('`')
        .and_then(|r| r.strip_suffix('`'))
        .unwrap_or(rest);
    if id.is_empty() || id.contains(char::is_whitespace) {
        None
    } else {
        Some(id)
    }
}
