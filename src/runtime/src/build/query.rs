//! Read-only queries against the image being built or the host.

use box_core::cancel::CancelScope;
use box_core::error::{BoxError, Result};

use crate::engine::Engine;
use crate::plan::Query;

pub const PASSWD_FILE: &str = "/etc/passwd";
pub const GROUP_FILE: &str = "/etc/group";

/// Find the numeric id for `name` in colon-delimited account data
/// (`/etc/passwd` or `/etc/group` format): the third field of the first
/// line whose first field is `name`.
pub fn lookup_id(content: &str, name: &str, kind: &str) -> Result<String> {
    content
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|parts| parts.len() > 2 && parts[0] == name)
        .map(|parts| parts[2].to_string())
        .ok_or_else(|| BoxError::LookupNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        })
}

/// Evaluate a query. Image queries fail without engine calls when no base
/// image has been established.
pub async fn evaluate(
    query: &Query,
    image: &str,
    engine: &dyn Engine,
    scope: &CancelScope,
) -> Result<String> {
    if query.needs_image() && image.is_empty() {
        return Err(BoxError::PrerequisiteError {
            capability: query.verb().name().to_string(),
        });
    }

    match query {
        Query::GetUid { user } => {
            let content = engine.read_file(image, PASSWD_FILE, scope).await?;
            lookup_id(&String::from_utf8_lossy(&content), user, "user")
        }
        Query::GetGid { group } => {
            let content = engine.read_file(image, GROUP_FILE, scope).await?;
            lookup_id(&String::from_utf8_lossy(&content), group, "group")
        }
        Query::Read { path } => {
            let content = engine.read_file(image, path, scope).await?;
            Ok(String::from_utf8_lossy(&content).to_string())
        }
        Query::GetEnv { name } => Ok(std::env::var(name).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    const PASSWD: &str = "alice:x:1000:1000::/home/alice:/bin/bash\n";

    #[test]
    fn test_lookup_id_found() {
        assert_eq!(lookup_id(PASSWD, "alice", "user").unwrap(), "1000");
    }

    #[test]
    fn test_lookup_id_not_found_names_entity() {
        let err = lookup_id(PASSWD, "bob", "user").unwrap_err();
        assert!(matches!(err, BoxError::LookupNotFound { .. }));
        assert!(err.to_string().contains("bob"));
    }

    #[test]
    fn test_lookup_id_skips_short_and_prefix_lines() {
        let content = "# comment\nalic:x:1:1::/:/bin/sh\nbroken\nalice:x:42:42::/:/bin/sh\n";
        assert_eq!(lookup_id(content, "alice", "user").unwrap(), "42");
    }

    #[test]
    fn test_lookup_id_group_format() {
        let content = "root:x:0:\nstaff:x:50:alice,bob\n";
        assert_eq!(lookup_id(content, "staff", "group").unwrap(), "50");
    }

    #[tokio::test]
    async fn test_image_query_without_base_makes_no_calls() {
        let engine = MemoryEngine::new();
        let scope = CancelScope::new();
        let query = Query::GetUid {
            user: "alice".to_string(),
        };

        let err = evaluate(&query, "", &engine, &scope).await.unwrap_err();
        assert!(matches!(
            err,
            BoxError::PrerequisiteError { ref capability } if capability == "getuid"
        ));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_getuid_and_getgid_against_image() {
        let engine = MemoryEngine::new();
        let scope = CancelScope::new();
        let image = engine.seed_image(
            "base",
            &[(PASSWD_FILE, PASSWD), (GROUP_FILE, "users:x:100:alice\n")],
        );

        let uid = evaluate(
            &Query::GetUid {
                user: "alice".into(),
            },
            &image,
            &engine,
            &scope,
        )
        .await
        .unwrap();
        assert_eq!(uid, "1000");

        let gid = evaluate(
            &Query::GetGid {
                group: "users".into(),
            },
            &image,
            &engine,
            &scope,
        )
        .await
        .unwrap();
        assert_eq!(gid, "100");
        assert_eq!(engine.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_getenv_needs_no_image() {
        let engine = MemoryEngine::new();
        let scope = CancelScope::new();
        let value = evaluate(
            &Query::GetEnv {
                name: "BOX_QUERY_TEST_SURELY_UNSET".into(),
            },
            "",
            &engine,
            &scope,
        )
        .await
        .unwrap();
        assert_eq!(value, "");
        assert!(engine.calls().is_empty());
    }
}
