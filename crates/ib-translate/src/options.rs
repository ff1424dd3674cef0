use crate::error::{Result, TranslateError};
use crate::naming::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationOptions {
    pub module_name: String,
    /// Mangled symbol -> display name override.
    pub renamed_symbols: BTreeMap<String, String>,
    /// Upper bound on nodes synthesized from one instruction's constant expressions.
    pub max_constant_expression_nodes: usize,
    pub emit_public_wrappers: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            module_name: "Translated".to_string(),
            renamed_symbols: BTreeMap::new(),
            max_constant_expression_nodes: 4096,
            emit_public_wrappers: true,
        }
    }
}

impl TranslationOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text)
            .map_err(|e| TranslateError::Config(format!("failed to parse options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn rename(mut self, mangled: impl Into<String>, name: impl Into<String>) -> Self {
        self.renamed_symbols.insert(mangled.into(), name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.module_name) {
            return Err(TranslateError::Config(format!(
                "module name '{}' is not a valid identifier",
                self.module_name
            )));
        }
        for (mangled, name) in &self.renamed_symbols {
            if !is_valid_identifier(name) {
                return Err(TranslateError::Config(format!(
                    "renamed symbol '{}' has an invalid name '{}'",
                    mangled, name
                )));
            }
        }
        if self.max_constant_expression_nodes == 0 {
            return Err(TranslateError::Config(
                "max_constant_expression_nodes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let options = TranslationOptions::from_toml_str(
            r#"
            [renamed_symbols]
            "?helper@@YAHH@Z" = "Helper"
            "#,
        )
        .expect("options");
        assert_eq!(options.module_name, "Translated");
        assert_eq!(options.max_constant_expression_nodes, 4096);
        assert!(options.emit_public_wrappers);
        assert_eq!(
            options.renamed_symbols.get("?helper@@YAHH@Z").map(String::as_str),
            Some("Helper")
        );
    }

    #[test]
    fn invalid_override_is_a_config_error() {
        let options = TranslationOptions::default().rename("_Z3foov", "not valid");
        let err = options.validate().unwrap_err();
        assert!(matches!(err, TranslateError::Config(_)));
        assert!(err.to_string().contains("_Z3foov"));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = TranslationOptions::from_toml_str("module_name = ").unwrap_err();
        assert!(matches!(err, TranslateError::Config(_)));
    }
}
