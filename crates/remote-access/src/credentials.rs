//! Object-store credentials.

use data_catalog::StorageOptions;

/// Credentials and endpoint overrides for object-store access.
///
/// Every field is optional; anything left unset falls back to the ambient
/// AWS environment picked up by the store builder.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Custom S3-compatible endpoint (MinIO, localstack).
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Send unsigned requests.
    pub anonymous: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "***"),
            )
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("anonymous", &self.anonymous)
            .finish()
    }
}

impl Credentials {
    /// Anonymous access, for public buckets.
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Self::default()
        }
    }

    pub fn with_keys(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: Some(access_key_id.into()),
            secret_access_key: Some(secret_access_key.into()),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Load from the standard AWS variables plus `CATALOG_ANONYMOUS`.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        Self {
            endpoint: var("AWS_ENDPOINT_URL").or_else(|| var("AWS_ENDPOINT")),
            region: var("AWS_REGION").or_else(|| var("AWS_DEFAULT_REGION")),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            session_token: var("AWS_SESSION_TOKEN"),
            anonymous: var("CATALOG_ANONYMOUS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn has_keys(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    /// Apply an entry's storage hints on top of these credentials.
    ///
    /// Entry hints win for region and endpoint. `anon: true` on the entry
    /// forces unsigned requests; `anon: false` forces signing.
    pub fn merged_with(&self, options: &StorageOptions) -> Self {
        let mut merged = self.clone();
        if let Some(region) = &options.region {
            merged.region = Some(region.clone());
        }
        if let Some(endpoint) = &options.endpoint_url {
            merged.endpoint = Some(endpoint.clone());
        }
        if let Some(anon) = options.anon {
            merged.anonymous = anon;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_hints_override() {
        let base = Credentials::with_keys("key", "secret").with_region("us-east-2");
        let options = StorageOptions {
            anon: Some(true),
            region: Some("us-west-2".into()),
            endpoint_url: None,
        };

        let merged = base.merged_with(&options);
        assert!(merged.anonymous);
        assert_eq!(merged.region.as_deref(), Some("us-west-2"));
        assert_eq!(merged.access_key_id.as_deref(), Some("key"));
    }

    #[test]
    fn test_empty_hints_keep_base() {
        let base = Credentials::anonymous().with_endpoint("http://localhost:9000");
        assert_eq!(base.merged_with(&StorageOptions::default()), base);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::with_keys("AKIA", "very-secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("AKIA"));
        assert!(!debug.contains("very-secret"));
    }
}
