//! Shared helpers for running collaborator processes.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty stderr line, falling back to the exit code.
    pub fn error_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Spawn `argv`, write `input` to its stdin, and collect its output.
///
/// The child is killed if the returned future is dropped, so callers can
/// bound it with `tokio::time::timeout` or a cancellation `select!`.
pub async fn run_piped(
    argv: &[String],
    input: &str,
    envs: &[(&str, &str)],
    working_dir: Option<&Path>,
) -> Result<ProcessOutput> {
    let Some((program, args)) = argv.split_first() else {
        bail!("Command is empty");
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits without reading stdin closes the pipe; that is
        // not an error on our side.
        if let Err(err) = stdin.write_all(input.as_bytes()).await
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(err).context("Failed to write to child stdin");
        }
        drop(stdin);
    }

    let mut stdout = child.stdout.take().context("Failed to get stdout")?;
    let mut stderr = child.stderr.take().context("Failed to get stderr")?;
    let mut out = String::new();
    let mut err = String::new();
    let (out_res, err_res, status) = tokio::join!(
        stdout.read_to_string(&mut out),
        stderr.read_to_string(&mut err),
        child.wait()
    );
    out_res.context("Failed to read child stdout")?;
    err_res.context("Failed to read child stderr")?;
    let status = status.context("Failed to wait for child process")?;

    Ok(ProcessOutput {
        code: status.code(),
        stdout: out,
        stderr: err,
    })
}

/// Extract the outermost JSON object from text that may contain other
/// content. Braces inside string literals are ignored.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_surrounding_text() {
        let text = r#"Review done: {"verdict": "pass"} bye"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"verdict": "pass"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"issue": "missing } in fmt", "n": {"x": 1}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn test_error_summary_prefers_stderr() {
        let out = ProcessOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "warming up\ncompile error\n\n".into(),
        };
        assert_eq!(out.error_summary(), "compile error");
        let out = ProcessOutput {
            code: Some(3),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(out.error_summary(), "exited with code 3");
    }

    #[tokio::test]
    async fn test_run_piped_echoes_stdin() {
        let argv = vec!["cat".to_string()];
        let out = run_piped(&argv, "hello", &[], None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_piped_passes_env() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf %s \"$STRIDE_TASK_ID\"; exit 4".to_string(),
        ];
        let out = run_piped(&argv, "", &[("STRIDE_TASK_ID", "T7")], None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "T7");
        assert_eq!(out.code, Some(4));
    }

    #[tokio::test]
    async fn test_run_piped_rejects_empty_argv() {
        assert!(run_piped(&[], "", &[], None).await.is_err());
    }
}
