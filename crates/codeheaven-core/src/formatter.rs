//! Output normalization and compiler diagnostic rewriting.
//!
//! All output loses ANSI escape sequences and non-printable control
//! characters. Stderr of compiled languages additionally goes through a
//! fixed table of rewrites that hide generated file paths and linker noise.
//! Lines that match no rule pass through unchanged.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::demux::Channel;
use crate::languages::Language;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI pattern"));

struct Rewrite {
    pattern: Regex,
    replacement: &'static str,
}

impl Rewrite {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("valid rewrite pattern"),
            replacement,
        }
    }
}

// Applied in order. More specific patterns come first.
static COMPILER_REWRITES: Lazy<Vec<Rewrite>> = Lazy::new(|| {
    vec![
        // gcc: "/tmp/main.c: In function 'main':"
        Rewrite::new(r"/tmp/main\.(?:c|cpp): ", ""),
        // "/tmp/main.c:3:5: error: ..." -> "Line 3:5: error: ..."
        Rewrite::new(r"/tmp/main\.(?:c|cpp):", "Line "),
        // Object files of the compiler driver: "/tmp/ccAbC123.o: "
        Rewrite::new(r"/tmp/cc[A-Za-z0-9]+\.o:?\s?", ""),
        Rewrite::new(r"/usr/bin/ld: ", ""),
        Rewrite::new(r"(?m)^collect2: error: ld returned \d+ exit status\n?", ""),
        Rewrite::new(r"undefined reference to", "Undefined function/variable:"),
        Rewrite::new(r"(?:\(\.text\+0x[0-9a-f]+\)|\(\.text\.startup\+0x[0-9a-f]+\)): ?", ""),
        Rewrite::new(r"/tmp/compile\.log", "compiler output"),
    ]
});

/// Strip escape sequences and control characters other than `\n`, `\r`
/// and `\t`.
pub fn sanitize(text: &str) -> String {
    let without_ansi = ANSI_ESCAPE.replace_all(text, "");
    without_ansi
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Rewrite compiler and linker jargon into reader-facing text.
pub fn rewrite_diagnostics(text: &str) -> String {
    COMPILER_REWRITES
        .iter()
        .fold(text.to_string(), |acc, rule| {
            rule.pattern.replace_all(&acc, rule.replacement).into_owned()
        })
}

/// Produce the text shown to the client for one output frame.
pub fn format(text: &str, channel: Channel, language: Language) -> String {
    let clean = sanitize(text);
    if channel == Channel::Stderr && language.is_compiled() {
        rewrite_diagnostics(&clean)
    } else {
        clean
    }
}
