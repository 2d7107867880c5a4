//! Language registry
//!
//! The set of runnable languages is closed: [`Language`] enumerates them and
//! every per-language detail (image, timeout, invocation script) is decided by
//! an exhaustive match. Configuration can swap the image or timeout of a
//! language but cannot add one.
//!
//! Code never reaches the container command line. It is base64-encoded into
//! the `CODE_B64` environment variable and decoded by a fixed script inside
//! the container.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::LanguageOverride;
use crate::errors::{ConfigError, RegistryError};

/// Environment variable carrying the encoded source inside the container.
pub const CODE_ENV_VAR: &str = "CODE_B64";

/// Largest accepted source snippet. Keeps the encoded payload well under the
/// kernel's per-string environment limit.
pub const MAX_CODE_BYTES: usize = 64 * 1024;

/// Path of the generated C source inside the container.
pub const C_SOURCE_PATH: &str = "/tmp/main.c";
/// Path of the generated C++ source inside the container.
pub const CPP_SOURCE_PATH: &str = "/tmp/main.cpp";

/// Header the compiled-language scripts print before compiler diagnostics.
pub const COMPILATION_ERRORS_HEADER: &str = "Compilation errors:";
/// Prefix the compiled-language scripts print when the program exits non-zero.
pub const RUNTIME_ERROR_PREFIX: &str = "Runtime error:";

const PYTHON_SCRIPT: &str = r#"printf '%s' "$CODE_B64" | base64 -d > /tmp/main.py || exit 1
exec python3 -u /tmp/main.py"#;

const JAVASCRIPT_SCRIPT: &str = r#"printf '%s' "$CODE_B64" | base64 -d > /tmp/main.js || exit 1
exec node /tmp/main.js"#;

const C_SCRIPT: &str = r#"printf '%s' "$CODE_B64" | base64 -d > /tmp/main.c || exit 1
if ! gcc -O2 -o /tmp/main /tmp/main.c -lm 2> /tmp/compile.log; then
  echo "Compilation errors:" >&2
  cat /tmp/compile.log >&2
  exit 1
fi
/tmp/main
status=$?
if [ "$status" -ne 0 ]; then
  echo "Runtime error: exit code $status" >&2
fi
exit "$status""#;

const CPP_SCRIPT: &str = r#"printf '%s' "$CODE_B64" | base64 -d > /tmp/main.cpp || exit 1
if ! g++ -O2 -o /tmp/main /tmp/main.cpp 2> /tmp/compile.log; then
  echo "Compilation errors:" >&2
  cat /tmp/compile.log >&2
  exit 1
fi
/tmp/main
status=$?
if [ "$status" -ne 0 ]; then
  echo "Runtime error: exit code $status" >&2
fi
exit "$status""#;

const HTML_SCRIPT: &str = "echo 'HTML cannot be executed directly'";

/// A supported language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    C,
    Cpp,
    Html,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::JavaScript,
        Language::C,
        Language::Cpp,
        Language::Html,
    ];

    /// Canonical identifier as used on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Html => "html",
        }
    }

    /// Languages with a separate compile phase.
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::C | Language::Cpp)
    }

    /// Path the script writes the decoded source to.
    pub fn source_path(&self) -> Option<&'static str> {
        match self {
            Language::Python => Some("/tmp/main.py"),
            Language::JavaScript => Some("/tmp/main.js"),
            Language::C => Some(C_SOURCE_PATH),
            Language::Cpp => Some(CPP_SOURCE_PATH),
            Language::Html => None,
        }
    }

    fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.11-slim",
            Language::JavaScript => "node:18-slim",
            Language::C | Language::Cpp => "gcc:13",
            Language::Html => "alpine:3.19",
        }
    }

    fn default_timeout(&self) -> Duration {
        match self {
            Language::Python | Language::JavaScript => Duration::from_millis(5_000),
            Language::C | Language::Cpp => Duration::from_millis(10_000),
            Language::Html => Duration::from_millis(1_000),
        }
    }

    fn script(&self) -> &'static str {
        match self {
            Language::Python => PYTHON_SCRIPT,
            Language::JavaScript => JAVASCRIPT_SCRIPT,
            Language::C => C_SCRIPT,
            Language::Cpp => CPP_SCRIPT,
            Language::Html => HTML_SCRIPT,
        }
    }
}

impl FromStr for Language {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "html" => Ok(Language::Html),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// How one language is run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionProfile {
    pub language: Language,
    pub image: String,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Container command and environment for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
}

impl ExecutionProfile {
    pub fn default_for(language: Language) -> Self {
        Self {
            language,
            image: language.default_image().to_string(),
            timeout: language.default_timeout(),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Build the container invocation for `code`.
    ///
    /// The command is the same for every snippet of a language; only the
    /// environment differs.
    pub fn invocation(&self, code: &str) -> Invocation {
        let mut env = vec![
            format!("{}={}", CODE_ENV_VAR, BASE64.encode(code.as_bytes())),
            "LANG=C.UTF-8".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        if self.language == Language::JavaScript {
            env.push("NODE_ENV=production".to_string());
        }

        Invocation {
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                self.language.script().to_string(),
            ],
            env,
        }
    }
}

/// Read-only table of execution profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, ExecutionProfile>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        let profiles = Language::ALL
            .iter()
            .map(|lang| (*lang, ExecutionProfile::default_for(*lang)))
            .collect();
        Self { profiles }
    }
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry, applying per-language overrides keyed by identifier.
    pub fn with_overrides(
        overrides: &HashMap<String, LanguageOverride>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for (key, over) in overrides {
            let language = key.parse::<Language>().map_err(|_| {
                ConfigError::Invalid(format!("Unknown language '{}' in languages section", key))
            })?;
            let profile = registry
                .profiles
                .get_mut(&language)
                .ok_or_else(|| ConfigError::Invalid(format!("No profile for '{}'", key)))?;
            if let Some(image) = &over.image {
                if image.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Image for '{}' must not be empty",
                        key
                    )));
                }
                profile.image = image.clone();
            }
            if let Some(timeout_ms) = over.timeout_ms {
                if timeout_ms == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "Timeout for '{}' must be greater than zero",
                        key
                    )));
                }
                profile.timeout = Duration::from_millis(timeout_ms);
            }
        }
        Ok(registry)
    }

    /// Look up the profile for a language identifier.
    pub fn resolve(&self, language_id: &str) -> Result<&ExecutionProfile, RegistryError> {
        language_id
            .parse::<Language>()
            .ok()
            .and_then(|lang| self.profiles.get(&lang))
            .ok_or_else(|| RegistryError::NotFound {
                language: language_id.to_string(),
                supported: self.supported().iter().map(|s| s.to_string()).collect(),
            })
    }

    /// Canonical identifiers in a stable order.
    pub fn supported(&self) -> Vec<&'static str> {
        Language::ALL.iter().map(|lang| lang.id()).collect()
    }

    /// All profiles in a stable order.
    pub fn profiles(&self) -> Vec<&ExecutionProfile> {
        Language::ALL
            .iter()
            .filter_map(|lang| self.profiles.get(lang))
            .collect()
    }
}
