use super::Briefcase;
use crate::config::{self, SecretLifetime};

// Freshness for static and token scoped artifacts is presence in a set, not
// a timestamp: once written they stay written until the set is dropped (a
// briefcase reset drops the token-scoped sets). Version-lifetime secrets are
// tracked separately in versioned_secrets and never pass through here.

impl Briefcase {
    pub fn should_refresh_secret(&self, secret: &config::Secret) -> bool {
        match secret.lifetime() {
            SecretLifetime::Token => !self.token_scoped_secrets.contains_key(&secret.path),
            SecretLifetime::Static => !self.static_scoped_secrets.contains_key(&secret.path),
            SecretLifetime::Version => {
                tracing::error!(
                    key = %secret.key,
                    "internal error: the briefcase does not manage refresh of version-lifetime secrets"
                );
                true
            }
        }
    }

    pub fn enroll_secret(&mut self, secret: &config::Secret) {
        tracing::info!(vault_path = %secret.path, lifetime = %secret.lifetime(), "enrolling secret");
        match secret.lifetime() {
            SecretLifetime::Token => {
                self.token_scoped_secrets.insert(secret.path.clone(), true);
            }
            SecretLifetime::Static => {
                self.static_scoped_secrets.insert(secret.path.clone(), true);
            }
            SecretLifetime::Version => {
                tracing::error!(
                    key = %secret.key,
                    "internal error: version-lifetime secrets cannot be enrolled in freshness sets"
                );
            }
        }
    }

    pub fn should_refresh_template(&self, template: &config::TemplateStanza) -> bool {
        if template.lifetime() == SecretLifetime::Token {
            !self.token_scoped_templates.contains_key(&template.output)
        } else {
            !self.static_templates.contains_key(&template.output)
        }
    }

    pub fn enroll_template(&mut self, template: &config::TemplateStanza) {
        tracing::info!(output_file = %template.output, lifetime = %template.lifetime(), "enrolling template");
        if template.lifetime() == SecretLifetime::Token {
            self.token_scoped_templates
                .insert(template.output.clone(), true);
        } else {
            self.static_templates.insert(template.output.clone(), true);
        }
    }

    pub fn should_refresh_composite(&self, composite: &config::CompositeSecretFile) -> bool {
        if composite.lifetime == SecretLifetime::Token {
            !self
                .token_scoped_composites
                .contains_key(&composite.filename)
        } else {
            !self
                .static_scoped_composites
                .contains_key(&composite.filename)
        }
    }

    pub fn enroll_composite(&mut self, composite: &config::CompositeSecretFile) {
        tracing::info!(filename = %composite.filename, lifetime = %composite.lifetime, "enrolling composite secret");
        if composite.lifetime == SecretLifetime::Token {
            self.token_scoped_composites
                .insert(composite.filename.clone(), true);
        } else {
            self.static_scoped_composites
                .insert(composite.filename.clone(), true);
        }
    }
}
