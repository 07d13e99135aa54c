use api::PipelineError;
use zeroize::Zeroizing;

// indirection between a pipeline request's key arguments and the PEM bytes
// backing them. requests may carry a PEM key inline, or reference one the
// operator has provisioned out of band by name -- `resolve` turns the latter
// into the former. the returned PEM text is request-scoped key material, so
// it's wrapped to be zeroed on drop rather than left lingering in memory
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, key_ref: &str) -> Result<Zeroizing<String>, PipelineError>;
}

// looks a key reference up as `CRYPT4GH_KEY_{key_ref}` in the process
// environment. the reference is upper-cased and non-alphanumeric bytes are
// replaced with `_` before lookup so callers can't smuggle arbitrary env var
// names through a pipeline argument
pub struct EnvKeyResolver;

impl EnvKeyResolver {
    fn env_var_name(key_ref: &str) -> String {
        let sanitized: String = key_ref
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("CRYPT4GH_KEY_{sanitized}")
    }
}

impl KeyResolver for EnvKeyResolver {
    fn resolve(&self, key_ref: &str) -> Result<Zeroizing<String>, PipelineError> {
        let var = Self::env_var_name(key_ref);
        std::env::var(&var)
            .map(Zeroizing::new)
            .map_err(|_| PipelineError::NotFound(format!("no key provisioned for reference `{key_ref}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_reference_before_building_the_env_var_name() {
        assert_eq!(EnvKeyResolver::env_var_name("lab-1"), "CRYPT4GH_KEY_LAB_1");
    }

    #[test]
    fn missing_reference_is_not_found() {
        let resolver = EnvKeyResolver;
        assert!(matches!(
            resolver.resolve("definitely-unset-ref"),
            Err(PipelineError::NotFound(_))
        ));
    }
}
