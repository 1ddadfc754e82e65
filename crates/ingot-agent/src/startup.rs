use std::sync::OnceLock;

use regex::Regex;

use crate::error::EngineError;

pub const MAX_FLAGS_LEN: usize = 600;

fn jar_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s-jar\b").expect("valid -jar pattern"))
}

fn shell_metachars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[;&|<>`$\r\n]").expect("valid metachar pattern"))
}

fn jar_override() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)-jar\b|\bserver\.jar\b").expect("valid jar pattern"))
}

fn memory_override() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)-Xm[xs]").expect("valid memory pattern"))
}

fn java_override() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^java\b").expect("valid java pattern"))
}

/// Validate free-form JVM flags against the deny-list.
///
/// NOTE: This is a string blocklist, not a flag parser; creative encodings can
/// get past it. It only guards against the obvious ways of breaking out of the
/// launch line or overriding the memory/jar settings owned by the panel.
pub fn validate_flags(raw: &str) -> Result<String, EngineError> {
    let flags = raw.trim();
    if flags.is_empty() {
        return Ok(String::new());
    }
    if flags.len() > MAX_FLAGS_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "flags are too long ({} > {MAX_FLAGS_LEN} characters)",
            flags.len()
        )));
    }
    if shell_metachars().is_match(flags) {
        return Err(EngineError::InvalidArgument(
            "flags contain unsupported characters like shell separators".to_string(),
        ));
    }
    if jar_override().is_match(flags) {
        return Err(EngineError::InvalidArgument(
            "flags cannot modify the server jar configuration".to_string(),
        ));
    }
    if memory_override().is_match(flags) {
        return Err(EngineError::InvalidArgument(
            "flags cannot change the allocated memory".to_string(),
        ));
    }
    if java_override().is_match(flags) {
        return Err(EngineError::InvalidArgument(
            "flags cannot override the java executable".to_string(),
        ));
    }
    Ok(flags.to_string())
}

/// Validate a launch template: a plain `java` invocation with exactly one
/// `-jar <file>` segment and at most one heap flag of each kind.
pub fn validate_base_command(raw: &str) -> Result<String, EngineError> {
    let base = raw.trim();
    if base.is_empty() {
        return Err(EngineError::InvalidArgument(
            "startup command must be non-empty".to_string(),
        ));
    }
    if shell_metachars().is_match(base) {
        return Err(EngineError::InvalidArgument(
            "startup command contains unsupported characters like shell separators".to_string(),
        ));
    }

    let tokens: Vec<&str> = base.split_whitespace().collect();
    if tokens.first().map(|t| t.to_ascii_lowercase()) != Some("java".to_string()) {
        return Err(EngineError::InvalidArgument(
            "startup command must invoke java".to_string(),
        ));
    }

    let jar_at: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.eq_ignore_ascii_case("-jar"))
        .map(|(i, _)| i)
        .collect();
    let &[jar] = jar_at.as_slice() else {
        return Err(EngineError::InvalidArgument(
            "startup command must contain exactly one -jar segment".to_string(),
        ));
    };
    match tokens.get(jar + 1) {
        Some(file) if !file.starts_with('-') => {}
        _ => {
            return Err(EngineError::InvalidArgument(
                "startup command -jar must name a jar file".to_string(),
            ));
        }
    }

    for prefix in ["-xmx", "-xms"] {
        let n = tokens
            .iter()
            .filter(|t| t.to_ascii_lowercase().starts_with(prefix))
            .count();
        if n > 1 {
            return Err(EngineError::InvalidArgument(format!(
                "startup command repeats {prefix}"
            )));
        }
    }
    Ok(base.to_string())
}

/// Splice `flags` right before the `-jar` token of `base`, or append them when
/// there is no `-jar` token.
pub fn compose(base: &str, flags: &str) -> String {
    let base = base.trim();
    let flags = flags.trim();
    if flags.is_empty() {
        return base.to_string();
    }

    let Some(m) = jar_token().find(base) else {
        return format!("{base} {flags}").trim().to_string();
    };

    let prefix = base[..m.start()].trim_end();
    let suffix = base[m.start()..].trim_start();
    format!("{prefix} {flags} {suffix}").trim().to_string()
}

pub fn default_base_command(memory_gb: u32) -> String {
    let gb = memory_gb.max(1);
    format!("java -Xmx{gb}G -Xms{gb}G -jar server.jar nogui")
}

/// Launch configuration for one managed server: an immutable base template
/// plus validated extra flags.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StartupCommand {
    base_command: String,
    flags: String,
}

impl StartupCommand {
    pub fn new(base_command: &str, flags: &str) -> Result<Self, EngineError> {
        Ok(Self {
            base_command: validate_base_command(base_command)?,
            flags: validate_flags(flags)?,
        })
    }

    pub fn base_command(&self) -> &str {
        &self.base_command
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    pub fn effective(&self) -> String {
        compose(&self.base_command, &self.flags)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StartupView {
    pub base_command: String,
    pub flags: String,
    pub effective_command: String,
}

impl From<&StartupCommand> for StartupView {
    fn from(value: &StartupCommand) -> Self {
        Self {
            base_command: value.base_command.clone(),
            flags: value.flags.clone(),
            effective_command: value.effective(),
        }
    }
}
