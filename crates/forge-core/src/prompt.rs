//! Prompt assembly for executor spawns.

use crate::completion::COMPLETION_TOKEN;

/// Template for implementation runs. The executor substitutes the project
/// name and the specification text produced upstream.
const IMPLEMENTATION_TEMPLATE: &str = "\
You are implementing a feature for the project {project_name}.

Specification:

{spec}

Work directly in the current checkout. Commit your changes when done.
When the implementation is finished, print a final report in this exact
shape:

{token}

Files changed:
- <path>

What was built:
<one short paragraph>

How to verify:
<one short paragraph>
";

/// Build the implementation prompt for a feature execution.
pub fn build_implementation_prompt(project_name: &str, spec: &str) -> String {
    IMPLEMENTATION_TEMPLATE
        .replace("{project_name}", project_name)
        .replace("{spec}", spec)
        .replace("{token}", COMPLETION_TOKEN)
}

/// Make a branch name filesystem-safe (slashes to hyphens).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_substitutes_project_and_spec() {
        let prompt = build_implementation_prompt("AirFit", "FEATURE: Dark mode");
        assert!(prompt.contains("project AirFit"));
        assert!(prompt.contains("FEATURE: Dark mode"));
        assert!(prompt.contains(COMPLETION_TOKEN));
        assert!(!prompt.contains("{spec}"));
    }

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(sanitize_branch_name("feature/dark-mode"), "feature-dark-mode");
        assert_eq!(sanitize_branch_name("plain"), "plain");
    }
}
