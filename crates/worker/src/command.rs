//! Builder backed by an external program.
//!
//! The program is run as `PROG [ARGS..] <contest> <key>` (also exported as
//! `RANKD_CONTEST` / `RANKD_KEY`) and must print one JSON object on stdout:
//! `{"snapshot": <any JSON>, "pages": ["<page 1>", ...]}`.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use anyhow::Context;
use rankd_core::{BuilderError, BuiltRanking, ContestId, RankingBuilder, RankingKey};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Output {
    #[serde(default)]
    snapshot: serde_json::Value,
    #[serde(default)]
    pages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl RankingBuilder for CommandBuilder {
    fn build(&self, contest_id: &ContestId, key: &RankingKey) -> Result<BuiltRanking, BuilderError> {
        let program = self.program.to_string_lossy();
        debug!(program = %program, contest = %contest_id, key = %key, "running builder command");
        let out = Command::new(&self.program)
            .args(&self.args)
            .arg(contest_id.as_str())
            .arg(key.as_str())
            .env("RANKD_CONTEST", contest_id.as_str())
            .env("RANKD_KEY", key.as_str())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BuilderError::Command(format!("spawning {program}: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(BuilderError::Command(format!("{program} exited with {}: {}", out.status, stderr.trim())));
        }
        let parsed: Output = serde_json::from_slice(&out.stdout)
            .map_err(|e| BuilderError::Inconsistent(format!("{program} printed invalid ranking JSON: {e}")))?;
        let snapshot = serde_json::to_vec(&parsed.snapshot).context("encoding snapshot")?;
        Ok(BuiltRanking { snapshot, pages: parsed.pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandBuilder {
        CommandBuilder::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn parses_snapshot_and_pages() {
        // sh -c SCRIPT contest key => $0 = contest, $1 = key
        let b = sh(r#"printf '{"snapshot":{"contest":"%s","key":"%s"},"pages":["p1","p2"]}' "$0" "$1""#);
        let built = b.build(&"demo".into(), &"c".into()).unwrap();
        assert_eq!(built.pages, vec!["p1".to_string(), "p2".to_string()]);
        let snap: serde_json::Value = serde_json::from_slice(&built.snapshot).unwrap();
        assert_eq!(snap["contest"], "demo");
        assert_eq!(snap["key"], "c");
    }

    #[test]
    fn env_carries_identity() {
        let b = sh(r#"printf '{"pages":["%s/%s"]}' "$RANKD_CONTEST" "$RANKD_KEY""#);
        let built = b.build(&"pa".into(), &"ab".into()).unwrap();
        assert_eq!(built.pages, vec!["pa/ab".to_string()]);
        assert_eq!(built.snapshot, b"null".to_vec());
    }

    #[test]
    fn failing_program_is_a_builder_error() {
        let err = sh("echo boom >&2; exit 3").build(&"x".into(), &"c".into()).unwrap_err();
        match err {
            BuilderError::Command(msg) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_output_is_rejected() {
        let err = sh("echo not-json").build(&"x".into(), &"c".into()).unwrap_err();
        assert!(matches!(err, BuilderError::Inconsistent(_)));
    }

    #[test]
    fn missing_program_is_reported() {
        let err = CommandBuilder::new("/nonexistent/rankd-builder").build(&"x".into(), &"c".into()).unwrap_err();
        assert!(matches!(err, BuilderError::Command(_)));
    }
}
