use std::collections::BTreeMap;

/// Fixed-variable text substitution: every `${key}` present in `vars` is
/// replaced; unknown keys are left untouched so missing values stay
/// visible in the rendered output.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("${{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_keys() {
        let mut vars = BTreeMap::new();
        vars.insert("job_name", "CFX_Job_2187".to_string());
        vars.insert("cores", "32".to_string());
        let rendered = render("#SBATCH --job-name=${job_name}\n# ${cores} cores", &vars);
        assert_eq!(rendered, "#SBATCH --job-name=CFX_Job_2187\n# 32 cores");
    }

    #[test]
    fn test_render_leaves_unknown_keys() {
        let vars = BTreeMap::new();
        assert_eq!(render("${missing}", &vars), "${missing}");
    }
}
