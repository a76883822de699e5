//! Command builders for the supported interpreters.
//!
//! A command is a script block plus its arguments, optionally wrapped for a
//! remote host. Before it is written to the interpreter's stdin it is wrapped
//! once more so that it fits the line-oriented transport and is followed by
//! the `<token>:<exit-code>` sentinel.

use std::fmt::Write as _;

use opsflow_core::config::DialectKind;
use opsflow_core::text::base64_encode;

use crate::workflow::Credential;

/// Heredoc terminator used when forwarding a POSIX script over ssh.
const REMOTE_EOF: &str = "OPSFLOW_REMOTE_EOF";

#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    #[error("Invalid parameter name '{0}'")]
    InvalidParameterName(String),

    #[error("Failed to serialize credentials: {0}")]
    Credentials(#[from] serde_json::Error),
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: ArgValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Where a command runs when it is not local.
#[derive(Debug, Clone, Copy)]
pub struct RemoteTarget<'a> {
    pub host: &'a str,
    pub credential: Option<&'a Credential>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptDialect {
    #[default]
    PowerShell,
    Posix,
}

impl From<DialectKind> for ScriptDialect {
    fn from(kind: DialectKind) -> Self {
        match kind {
            DialectKind::PowerShell => Self::PowerShell,
            DialectKind::Posix => Self::Posix,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `'text'` with embedded quotes doubled (PowerShell verbatim string).
fn ps_verbatim(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `"text"` with the characters PowerShell expands inside double quotes
/// escaped by a backtick.
fn ps_expandable(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '`' | '$') {
            out.push('`');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `'text'` with embedded quotes closed, escaped, and reopened.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn ps_decode(b64: &str) -> String {
    format!("[System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{b64}'))")
}

impl ScriptDialect {
    /// Render the argument list in this dialect's calling convention.
    pub fn render_arguments(self, args: &[Argument]) -> Result<String, DialectError> {
        if let Some(bad) = args.iter().find(|a| !is_identifier(&a.name)) {
            return Err(DialectError::InvalidParameterName(bad.name.clone()));
        }

        let rendered: Vec<String> = match self {
            Self::PowerShell => args
                .iter()
                .map(|a| {
                    let value = match &a.value {
                        ArgValue::Text(s) => ps_expandable(s),
                        ArgValue::Integer(i) => i.to_string(),
                        ArgValue::Number(n) => n.to_string(),
                        ArgValue::Boolean(true) => "$true".to_string(),
                        ArgValue::Boolean(false) => "$false".to_string(),
                        ArgValue::Null => "$null".to_string(),
                    };
                    format!("-{}:{value}", a.name)
                })
                .collect(),
            Self::Posix => args
                .iter()
                .map(|a| {
                    let value = match &a.value {
                        ArgValue::Text(s) => sh_quote(s),
                        ArgValue::Integer(i) => i.to_string(),
                        ArgValue::Number(n) => n.to_string(),
                        ArgValue::Boolean(b) => b.to_string(),
                        ArgValue::Null => String::new(),
                    };
                    format!("{}={value}", a.name)
                })
                .collect(),
        };

        let separator = match self {
            Self::PowerShell => " ",
            Self::Posix => "\n",
        };
        Ok(rendered.join(separator))
    }

    /// Build the full command for one target.
    pub fn build_command(
        self,
        script: &str,
        args: &[Argument],
        credentials: &[Credential],
        remote: Option<RemoteTarget<'_>>,
    ) -> Result<String, DialectError> {
        let rendered = self.render_arguments(args)?;
        let credentials_json = if credentials.is_empty() {
            None
        } else {
            Some(serde_json::to_string(credentials)?)
        };

        let command = match self {
            Self::PowerShell => {
                let mut body = String::new();
                if let Some(json) = &credentials_json {
                    let _ = writeln!(
                        body,
                        "$OpsflowCredentials = ConvertFrom-Json {}",
                        ps_verbatim(json)
                    );
                }
                let _ = write!(body, "& {{\n{script}\n}}");
                if !rendered.is_empty() {
                    body.push(' ');
                    body.push_str(&rendered);
                }
                match remote {
                    Some(target) => Self::powershell_remote(&body, target),
                    None => body,
                }
            }
            Self::Posix => {
                let mut body = String::new();
                if let Some(json) = &credentials_json {
                    let _ = writeln!(body, "OPSFLOW_CREDENTIALS={}", sh_quote(json));
                }
                if !rendered.is_empty() {
                    body.push_str(&rendered);
                    body.push('\n');
                }
                body.push_str(script);
                match remote {
                    Some(target) => Self::posix_remote(&body, target),
                    None => body,
                }
            }
        };
        Ok(command)
    }

    fn powershell_remote(body: &str, target: RemoteTarget<'_>) -> String {
        let mut out = format!("Invoke-Command -ComputerName {}", ps_verbatim(target.host));
        if let Some(cred) = target.credential {
            let _ = write!(
                out,
                " -Credential (New-Object System.Management.Automation.PSCredential({}, (ConvertTo-SecureString {} -AsPlainText -Force)))",
                ps_verbatim(&cred.username),
                ps_verbatim(&cred.secret),
            );
        }
        let _ = write!(
            out,
            " -ScriptBlock ([ScriptBlock]::Create({}))",
            ps_decode(&base64_encode(body.as_bytes()))
        );
        out
    }

    // Key-based auth only; a credential contributes its user name.
    fn posix_remote(body: &str, target: RemoteTarget<'_>) -> String {
        let mut out = String::from("ssh -o BatchMode=yes");
        if let Some(cred) = target.credential {
            let _ = write!(out, " -l {}", sh_quote(&cred.username));
        }
        let _ = write!(
            out,
            " {} sh -s <<'{REMOTE_EOF}'\n{body}\n{REMOTE_EOF}",
            sh_quote(target.host)
        );
        out
    }

    /// Wrap a command for submission over stdin, followed by the sentinel.
    ///
    /// The result always ends with a line terminator.
    pub fn wrap_for_stdin(self, command: &str, token: &str) -> String {
        match self {
            Self::PowerShell => format!(
                "$global:LASTEXITCODE = 0; try {{ Invoke-Expression {}; $__opsflowCode = if (-not $?) {{ 1 }} elseif ($LASTEXITCODE) {{ $LASTEXITCODE }} else {{ 0 }} }} catch {{ [Console]::Error.WriteLine($_.ToString()); $__opsflowCode = 1 }}; [Console]::Out.WriteLine('{token}:' + $__opsflowCode)\n",
                ps_decode(&base64_encode(command.as_bytes()))
            ),
            Self::Posix => format!(
                "(\n{command}\n) </dev/null\nprintf '%s:%d\\n' '{token}' \"$?\"\n"
            ),
        }
    }
}
