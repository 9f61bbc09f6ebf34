//! Per-file template validators.
//!
//! Validators run against template sources as they are applied, so a broken
//! stack file fails the build on the bench instead of on first boot.

use anyhow::Result;

use crate::board::ModuleImageRef;
use crate::errors::BuildError;

/// Context handed to every validator.
pub struct ValidatorContext {
    /// Modules the engine pre-seeder will pull into the card.
    pub modules: Vec<ModuleImageRef>,
    /// Accepted spellings of the board architecture, e.g. arm64v8/aarch64.
    pub arch_aliases: Vec<String>,
    /// Registry the build is configured against.
    pub registry: String,
}

pub type Validator = fn(&str, &ValidatorContext) -> Result<()>;

/// Returns the validators that apply to a template file at `rel_path`
/// (relative to its partition root).
pub fn validators_for(rel_path: &str) -> Vec<Validator> {
    let mut out: Vec<Validator> = Vec::new();
    if rel_path.ends_with(".yaml") || rel_path.ends_with(".yml") {
        out.push(yaml_syntax);
        if rel_path.contains("autoboot/") {
            out.push(autoboot_stack);
        }
    }
    out
}

/// The file must parse as YAML.
pub fn yaml_syntax(content: &str, _ctx: &ValidatorContext) -> Result<()> {
    serde_yaml::from_str::<serde_yaml::Value>(content)
        .map_err(|err| BuildError::Config(format!("invalid YAML in template: {err}")))?;
    Ok(())
}

/// Every image referenced by an autoboot stack must be resolvable to one of
/// the pre-seeded modules, so first boot never reaches for the network.
pub fn autoboot_stack(content: &str, ctx: &ValidatorContext) -> Result<()> {
    let doc: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|err| BuildError::Config(format!("invalid YAML in autoboot stack: {err}")))?;

    let services = doc
        .get("services")
        .and_then(|v| v.as_mapping())
        .ok_or_else(|| BuildError::Config("autoboot stack has no 'services' mapping".into()))?;

    let mut seeded: Vec<String> = Vec::new();
    for module in &ctx.modules {
        seeded.extend(module.candidates());
    }

    for (name, service) in services {
        let service_name = name.as_str().unwrap_or("<unnamed>");
        let image = service
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BuildError::Config(format!(
                    "autoboot service '{service_name}' has no 'image' field"
                ))
            })?;

        let candidates = expand_image(image, ctx)?;
        let matched = candidates.iter().any(|c| seeded.contains(c));
        if !matched {
            return Err(BuildError::Config(format!(
                "autoboot service '{service_name}' uses image '{image}' which no pre-seeded \
                 module provides"
            ))
            .into());
        }
    }
    Ok(())
}

/// Expands `${ARCH}`/`${REGISTRY}` (case-insensitive) into every concrete
/// spelling, including tag-stripped forms. Any other `${...}` token is
/// rejected rather than silently passed through.
fn expand_image(image: &str, ctx: &ValidatorContext) -> Result<Vec<String>> {
    let mut forms = vec![image.to_string()];

    // ${ARCH} fans out over every accepted alias.
    let mut next = Vec::new();
    for form in &forms {
        if find_ci(form, "${arch}").is_some() {
            for alias in &ctx.arch_aliases {
                next.push(replace_ci(form, "${arch}", alias));
            }
        } else {
            next.push(form.clone());
        }
    }
    forms = next;

    // ${REGISTRY} resolves to the configured registry, and to nothing at
    // all for the registry-less spelling.
    let mut next = Vec::new();
    for form in &forms {
        if find_ci(form, "${registry}").is_some() {
            next.push(replace_ci(form, "${registry}/", &format!("{}/", ctx.registry)));
            next.push(replace_ci(form, "${registry}/", ""));
        } else {
            next.push(form.clone());
        }
    }
    forms = next;

    for form in &forms {
        if form.contains("${") {
            return Err(BuildError::Config(format!(
                "unsupported variable in autoboot image '{image}'"
            ))
            .into());
        }
    }

    // Tag-stripped forms let a `owner/name` reference match `owner/name:tag`.
    let mut out = Vec::new();
    for form in forms {
        if let Some((repo, _tag)) = form.rsplit_once(':') {
            out.push(repo.to_string());
        }
        out.push(form);
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.to_ascii_lowercase();
    haystack.find(&needle.to_ascii_lowercase())
}

fn replace_ci(haystack: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = find_ci(rest, needle) {
        out.push_str(&rest[..pos]);
        out.push_str(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ValidatorContext {
        ValidatorContext {
            modules: vec![
                ModuleImageRef::new("docker.io", "duckietown", "dt-device-health", "ente-arm64v8"),
                ModuleImageRef::new("docker.io", "portainer", "portainer-ce", "linux-arm64"),
            ],
            arch_aliases: vec!["arm64v8".into(), "aarch64".into()],
            registry: "docker.io".into(),
        }
    }

    #[test]
    fn yaml_validator_rejects_malformed_input() {
        assert!(yaml_syntax("services:\n  ok: {}\n", &ctx()).is_ok());
        assert!(yaml_syntax("services: [unclosed\n", &ctx()).is_err());
    }

    #[test]
    fn autoboot_accepts_arch_and_registry_variables() {
        let stack = "\
version: '3'
services:
  device-health:
    image: ${REGISTRY}/duckietown/dt-device-health:ente-${ARCH}
";
        autoboot_stack(stack, &ctx()).unwrap();
    }

    #[test]
    fn autoboot_accepts_tag_stripped_reference() {
        let stack = "\
services:
  portainer:
    image: portainer/portainer-ce
";
        autoboot_stack(stack, &ctx()).unwrap();
    }

    #[test]
    fn arch_variable_with_differing_tags_matches_on_repository() {
        let with_module = ValidatorContext {
            modules: vec![ModuleImageRef::new("docker.io", "example", "svc", "arm64v8-v1")],
            arch_aliases: vec!["arm64v8".into()],
            registry: "docker.io".into(),
        };
        let stack = "\
services:
  svc:
    image: example/svc:${ARCH}
";
        autoboot_stack(stack, &with_module).unwrap();

        let without_module = ValidatorContext {
            modules: vec![],
            arch_aliases: vec!["arm64v8".into()],
            registry: "docker.io".into(),
        };
        assert!(autoboot_stack(stack, &without_module).is_err());
    }

    #[test]
    fn autoboot_rejects_unseeded_image() {
        let stack = "\
services:
  rogue:
    image: somewhere/unknown:latest
";
        let err = autoboot_stack(stack, &ctx()).unwrap_err();
        assert!(err.to_string().contains("rogue"));
    }

    #[test]
    fn autoboot_rejects_unknown_variable() {
        let stack = "\
services:
  svc:
    image: ${MYSTERY}/duckietown/dt-device-health:ente-arm64v8
";
        let err = autoboot_stack(stack, &ctx()).unwrap_err();
        assert!(err.to_string().contains("unsupported variable"));
    }

    #[test]
    fn case_insensitive_replacement() {
        assert_eq!(
            replace_ci("${Registry}/a", "${registry}/", "docker.io/"),
            "docker.io/a"
        );
    }

    #[test]
    fn validator_table_matches_autoboot_yaml() {
        assert_eq!(validators_for("data/autoboot/duckiebot.yaml").len(), 2);
        assert_eq!(validators_for("data/config/settings.yaml").len(), 1);
        assert_eq!(validators_for("etc/hostname").len(), 0);
    }
}
