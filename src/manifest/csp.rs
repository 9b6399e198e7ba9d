//! Content-security-policy directive editing.
//!
//! Only ever adds tokens. User-declared directives and tokens are kept in
//! their original order; a token already present is never added twice.

/// Policy used when the manifest declares none. Matches the browser default
/// for extension pages so adding a token never loosens or tightens anything
/// else.
pub const DEFAULT_EXTENSION_PAGES_POLICY: &str = "script-src 'self'; object-src 'self'";

/// A token that some injected helper needs in a given directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CspRequirement {
    pub directive: String,
    pub token: String,
}

impl CspRequirement {
    pub fn new(directive: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
            token: token.into(),
        }
    }
}

/// A parsed policy: ordered `(directive, tokens)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CspDirectives {
    directives: Vec<(String, Vec<String>)>,
}

impl CspDirectives {
    pub fn parse(policy: &str) -> Self {
        let directives = policy
            .split(';')
            .filter_map(|raw| {
                let mut parts = raw.split_whitespace();
                let name = parts.next()?.to_ascii_lowercase();
                Some((name, parts.map(str::to_string).collect()))
            })
            .collect();
        Self { directives }
    }

    pub fn tokens(&self, directive: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(name, _)| name == directive)
            .map(|(_, tokens)| tokens.as_slice())
    }

    /// Add `token` to `directive`, creating the directive when absent.
    /// Returns whether anything changed.
    pub fn add_token(&mut self, directive: &str, token: &str) -> bool {
        let directive = directive.to_ascii_lowercase();
        match self.directives.iter_mut().find(|(name, _)| *name == directive) {
            Some((_, tokens)) => {
                if tokens.iter().any(|t| t == token) {
                    return false;
                }
                tokens.push(token.to_string());
                true
            }
            None => {
                let mut tokens = Vec::new();
                // A fresh fetch directive would otherwise drop the implicit 'self'.
                if directive.ends_with("-src") && token != "'self'" {
                    tokens.push("'self'".to_string());
                }
                tokens.push(token.to_string());
                self.directives.push((directive, tokens));
                true
            }
        }
    }

    /// Apply every requirement. Returns whether anything changed.
    pub fn apply(&mut self, requirements: &[CspRequirement]) -> bool {
        let mut changed = false;
        for requirement in requirements {
            changed |= self.add_token(&requirement.directive, &requirement.token);
        }
        changed
    }
}

impl std::fmt::Display for CspDirectives {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .directives
            .iter()
            .map(|(name, tokens)| {
                if tokens.is_empty() {
                    name.clone()
                } else {
                    format!("{} {}", name, tokens.join(" "))
                }
            })
            .collect();
        f.write_str(&rendered.join("; "))
    }
}

/// Extend `policy` with `requirements`. Returns `None` when nothing changed,
/// so callers can leave the original string untouched.
pub fn extend_policy(policy: &str, requirements: &[CspRequirement]) -> Option<String> {
    let mut directives = CspDirectives::parse(policy);
    if directives.apply(requirements) {
        Some(directives.to_string())
    } else {
        None
    }
}
