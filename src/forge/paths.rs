//! Convention-based path derivation for skills.
//!
//! Given a proposal name (e.g. `write_note`), derive the skill source
//! path, the test path, and the dotted module reference. Every consumer
//! of skill paths (packet generation, diff gate, verification,
//! promotion) goes through this one convention.

use crate::error::{KilnError, Result};

/// Path convention anchored at configurable skill and test roots.
#[derive(Debug, Clone)]
pub struct PathConvention {
    skill_root: String,
    test_root: String,
}

impl PathConvention {
    pub fn new(skill_root: &str, test_root: &str) -> Self {
        Self {
            skill_root: skill_root.trim_matches('/').to_string(),
            test_root: test_root.trim_matches('/').to_string(),
        }
    }

    /// Repo-relative path of the skill implementation file.
    pub fn skill_rel(&self, name: &str) -> String {
        format!("{}/{name}.py", self.skill_root)
    }

    /// Repo-relative path of the skill's test file.
    pub fn test_rel(&self, name: &str) -> String {
        format!("{}/test_skill_{name}.py", self.test_root)
    }

    /// Dotted module reference, e.g. `skills.write_note.WriteNoteSkill`.
    pub fn module_ref(&self, name: &str) -> String {
        let package = self.skill_root.replace('/', ".");
        format!("{package}.{name}.{}", class_name(name))
    }
}

/// CamelCase skill class name: `write_note` becomes `WriteNoteSkill`.
pub fn class_name(name: &str) -> String {
    let camel: String = name
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    format!("{camel}Skill")
}

/// Validate a proposal name: lowercase, filesystem-safe, identifier-like.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_lowercase());
    let valid_rest = name
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_first || !valid_rest {
        return Err(KilnError::InvalidInput(format!(
            "invalid skill name '{name}': expected lowercase identifier like 'write_note'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convention() -> PathConvention {
        PathConvention::new("skills", "tests")
    }

    #[test]
    fn skill_and_test_paths_follow_convention() {
        let paths = convention();
        assert_eq!(paths.skill_rel("write_note"), "skills/write_note.py");
        assert_eq!(paths.test_rel("write_note"), "tests/test_skill_write_note.py");
    }

    #[test]
    fn module_ref_is_dotted_with_class() {
        assert_eq!(
            convention().module_ref("write_note"),
            "skills.write_note.WriteNoteSkill"
        );
    }

    #[test]
    fn nested_skill_root_becomes_dotted_package() {
        let paths = PathConvention::new("src/app/skills", "tests");
        assert_eq!(paths.skill_rel("fetch"), "src/app/skills/fetch.py");
        assert_eq!(paths.module_ref("fetch"), "src.app.skills.fetch.FetchSkill");
    }

    #[test]
    fn class_names_are_camel_case() {
        assert_eq!(class_name("write_note"), "WriteNoteSkill");
        assert_eq!(class_name("http_get_json"), "HttpGetJsonSkill");
        assert_eq!(class_name("x"), "XSkill");
    }

    #[test]
    fn valid_names_pass() {
        for name in ["write_note", "a", "fetch2", "read_notes_by_tag"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", "Write_Note", "1note", "../evil", "with space", "dash-ed"] {
            assert!(
                matches!(validate_name(name), Err(KilnError::InvalidInput(_))),
                "{name} should be invalid"
            );
        }
    }
}
