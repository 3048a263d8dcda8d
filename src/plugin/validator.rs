//! Static vetting of plugin source text
//!
//! Two checks, both mandatory:
//! - Structural shape: a class extending `BaseSource` and a default export
//! - Denylist: dynamic evaluation, string timers, process control,
//!   filesystem and raw-socket modules, host runtime internals
//!
//! This is pattern matching over text and is easy to evade; the isolate per
//! activation and the domain-scoped host fetch carry the rest of the load.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

use crate::core::error::{Result, SourceError};
use super::types::ValidationVerdict;

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

lazy_static! {
    static ref BASE_CLASS: Regex = Regex::new(
        r"\bclass(?:\s+[A-Za-z_$][\w$]*)?\s+extends\s+(?:[A-Za-z_$][\w$]*\s*\.\s*)?BaseSource\b"
    ).unwrap();

    static ref DEFAULT_EXPORT: Regex = Regex::new(
        r"\bexport\s+default\b|\bexport\s*\{[^}]*\bas\s+default\b[^}]*\}|\bmodule\s*\.\s*exports\s*=[^=]|\bexports\s*\.\s*default\s*=[^=]"
    ).unwrap();

    static ref FORBIDDEN_MODULE: Regex = Regex::new(
        r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)['"`](?:node:)?(child_process|cluster|worker_threads|fs/promises|fs|net|dgram|tls)['"`]"#
    ).unwrap();

    static ref DENYLIST: Vec<Rule> = vec![
        Rule {
            pattern: Regex::new(r"\beval\s*\(").unwrap(),
            reason: "dynamic evaluation: eval( is forbidden",
        },
        Rule {
            pattern: Regex::new(r"\bFunction\s*\(").unwrap(),
            reason: "dynamic function construction: Function( is forbidden",
        },
        Rule {
            pattern: Regex::new(r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#).unwrap(),
            reason: "string-bodied timer: setTimeout/setInterval with a string argument is forbidden",
        },
        Rule {
            pattern: Regex::new(r"\bprocess\s*\.\s*(?:exit|kill|binding|dlopen)\b").unwrap(),
            reason: "process control: process.exit/kill/binding/dlopen is forbidden",
        },
        Rule {
            pattern: Regex::new(r"\bDeno\s*\.").unwrap(),
            reason: "host runtime internals: Deno. is forbidden",
        },
    ];
}

/// Source text that passed validation
///
/// Only this module can build one, so the activator never sees text that
/// skipped vetting.
#[derive(Debug, Clone)]
pub struct ValidatedSource {
    text: String,
}

impl ValidatedSource {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Vet source text, enumerating every violated rule
pub fn validate(source: &str) -> ValidationVerdict {
    let mut reasons = Vec::new();

    if !BASE_CLASS.is_match(source) {
        reasons.push("structure: no class extending BaseSource".to_string());
    }
    if !DEFAULT_EXPORT.is_match(source) {
        reasons.push("structure: no default export".to_string());
    }

    for rule in DENYLIST.iter() {
        if rule.pattern.is_match(source) {
            reasons.push(rule.reason.to_string());
        }
    }

    let modules: BTreeSet<&str> = FORBIDDEN_MODULE
        .captures_iter(source)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    for module in modules {
        reasons.push(format!("forbidden module import: {}", module));
    }

    if reasons.is_empty() {
        ValidationVerdict::passed()
    } else {
        ValidationVerdict::failed(reasons)
    }
}

/// Vet raw artifact bytes
pub fn validate_bytes(bytes: &[u8]) -> ValidationVerdict {
    match std::str::from_utf8(bytes) {
        Ok(text) => validate(text),
        Err(e) => ValidationVerdict::failed(vec![format!("encoding: artifact is not valid UTF-8 ({})", e)]),
    }
}

/// Vet raw artifact bytes and hand back the text on success
pub fn validated_source(bytes: &[u8]) -> Result<ValidatedSource> {
    let verdict = validate_bytes(bytes);
    if !verdict.ok {
        debug!(reasons = ?verdict.reasons, "Plugin source rejected");
        return Err(SourceError::Validation { reasons: verdict.reasons });
    }

    // validate_bytes already proved the bytes are UTF-8
    let text = String::from_utf8_lossy(bytes).into_owned();
    Ok(ValidatedSource { text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{MINIMAL_PLUGIN, ESM_PLUGIN};
    use proptest::prelude::*;

    #[test]
    fn test_fixtures_pass() {
        assert_eq!(validate(MINIMAL_PLUGIN), ValidationVerdict::passed());
        assert_eq!(validate(ESM_PLUGIN), ValidationVerdict::passed());
    }

    #[test]
    fn test_structural_forms() {
        let assignment = "const Src = class extends BaseSource {};\nmodule.exports = Src;";
        assert!(validate(assignment).ok);

        let anonymous_default = "export default class extends Base.BaseSource {}";
        assert!(validate(anonymous_default).ok);

        let named_export = "class A extends BaseSource {}\nexport { A as default };";
        assert!(validate(named_export).ok);

        let exports_default = "class A extends BaseSource {}\nexports.default = A;";
        assert!(validate(exports_default).ok);
    }

    #[test]
    fn test_missing_structure_enumerated() {
        let verdict = validate("const x = 1;");
        assert!(!verdict.ok);
        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.reasons.iter().any(|r| r.contains("BaseSource")));
        assert!(verdict.reasons.iter().any(|r| r.contains("default export")));

        // Comparison is not assignment
        let verdict = validate("class A extends BaseSource {}\nif (module.exports == A) {}");
        assert!(!verdict.ok);
    }

    #[test]
    fn test_eval_rejected() {
        let source = format!("{}\nconst x = eval('1+1');", MINIMAL_PLUGIN);
        let verdict = validate(&source);
        assert!(!verdict.ok);
        assert!(verdict.reasons.iter().any(|r| r.contains("eval")));
    }

    #[test]
    fn test_all_violations_enumerated() {
        let source = format!(
            "{}\nnew Function('return 1');\nsetTimeout(\"alert(1)\", 10);\nconst cp = require('child_process');\nimport {{ readFile }} from 'node:fs/promises';\nprocess.exit(1);\nDeno.core.ops;",
            MINIMAL_PLUGIN
        );
        let verdict = validate(&source);
        assert!(!verdict.ok);
        let joined = verdict.reasons.join("\n");
        assert!(joined.contains("Function("));
        assert!(joined.contains("string-bodied timer"));
        assert!(joined.contains("child_process"));
        assert!(joined.contains("fs/promises"));
        assert!(joined.contains("process control"));
        assert!(joined.contains("Deno."));
        assert_eq!(verdict.reasons.len(), 6);
    }

    #[test]
    fn test_similar_identifiers_allowed() {
        let source = format!(
            "{}\nconst medieval = retrieval(1);\nconst myFunction = () => 1; myFunction();\nsetTimeout(() => {{}}, 5);\nconst fsx = require('./fs-helpers');",
            MINIMAL_PLUGIN
        );
        assert!(validate(&source).ok, "{:?}", validate(&source).reasons);
    }

    #[test]
    fn test_non_utf8_rejected() {
        let verdict = validate_bytes(&[0x63, 0x6c, 0xff, 0xfe]);
        assert!(!verdict.ok);
        assert!(verdict.reasons[0].contains("UTF-8"));
    }

    #[test]
    fn test_validated_source_error_kind() {
        let err = validated_source(b"module.exports = {}").unwrap_err();
        assert_eq!(err.error_type(), "ValidationFailure");

        let ok = validated_source(MINIMAL_PLUGIN.as_bytes()).unwrap();
        assert_eq!(ok.as_str(), MINIMAL_PLUGIN);
    }

    proptest! {
        #[test]
        fn validation_is_idempotent(text in "\\PC{0,200}") {
            let first = validate(&text);
            let second = validate(&text);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn suffix_cannot_clear_violations(suffix in "[a-z ;\\n]{0,40}") {
            let source = format!("{}\neval('x');{}", MINIMAL_PLUGIN, suffix);
            prop_assert!(!validate(&source).ok);
        }
    }
}
