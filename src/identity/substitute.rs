//! Prompt composition and runtime variable substitution.
//!
//! Substitution is literal string replacement, not template evaluation:
//! prompt content comes from end users, and a template engine would let a
//! crafted prompt execute code paths. Unknown `{{...}}` tokens pass
//! through unchanged.

/// Values substituted into a step's composed prompt.
#[derive(Debug, Clone, Default)]
pub struct RuntimeVars {
    pub run_id: String,
    pub step_index: usize,
    pub step_id: String,
    pub previous_step_id: String,
}

/// Composes the effective prompt for a step.
pub fn compose_prompt(prefix: &str, template: &str, suffix: &str) -> String {
    let mut prompt = String::with_capacity(prefix.len() + template.len() + suffix.len());
    prompt.push_str(prefix);
    prompt.push_str(template);
    prompt.push_str(suffix);
    prompt
}

/// Replaces every runtime variable token in `prompt` with its value.
///
/// Both the tight (`{{.RunID}}`) and spaced (`{{ .RunID }}`) spellings are
/// recognised for each variable.
pub fn substitute_runtime_vars(prompt: &str, vars: &RuntimeVars) -> String {
    let step_index = vars.step_index.to_string();
    let replacements: [(&str, &str); 4] = [
        ("RunID", vars.run_id.as_str()),
        ("StepIndex", step_index.as_str()),
        ("StepID", vars.step_id.as_str()),
        ("PreviousStepID", vars.previous_step_id.as_str()),
    ];

    let mut result = prompt.to_string();
    for (name, value) in replacements {
        result = result.replace(&format!("{{{{.{}}}}}", name), value);
        result = result.replace(&format!("{{{{ .{} }}}}", name), value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> RuntimeVars {
        RuntimeVars {
            run_id: "run-9".to_string(),
            step_index: 2,
            step_id: "test".to_string(),
            previous_step_id: "build".to_string(),
        }
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("a ", "b", " c"), "a b c");
    }

    #[test]
    fn test_substitute_tight_spelling() {
        let out = substitute_runtime_vars("run {{.RunID}} step {{.StepID}}", &vars());
        assert_eq!(out, "run run-9 step test");
    }

    #[test]
    fn test_substitute_spaced_spelling() {
        let out = substitute_runtime_vars("{{ .StepIndex }} after {{ .PreviousStepID }}", &vars());
        assert_eq!(out, "2 after build");
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        let out = substitute_runtime_vars("{{.Mystery}} and {{ malformed }", &vars());
        assert_eq!(out, "{{.Mystery}} and {{ malformed }");
    }

    #[test]
    fn test_replacement_order_is_fixed() {
        // Replacement is plain string replace applied in declaration order.
        let custom = RuntimeVars {
            run_id: "{{.StepID}}".to_string(),
            ..vars()
        };
        let out = substitute_runtime_vars("{{.RunID}}", &custom);
        assert_eq!(out, "test");
    }
}
