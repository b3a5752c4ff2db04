pub mod resolver;

/// Build the default resolver: env-var provider registered under `env`.
/// Additional providers can be registered by callers that need them.
pub fn default_resolver(strict: bool) -> resolver::SecretResolver {
    let mut r = resolver::SecretResolver::new(strict);
    r.register(Box::new(resolver::EnvProvider));
    r
}
