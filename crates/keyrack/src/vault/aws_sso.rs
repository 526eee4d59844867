//! `aws.iam.sso`: stores only a profile name
//!
//! `get` hands back the profile; `EPHEMERAL_VIA_AWS_SSO` turns it into
//! session credentials at grant time. No credential is ever written.

use crate::error::{KeyrackError, Result};
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct AwsSsoVault;

#[async_trait]
impl Vault for AwsSsoVault {
    fn kind(&self) -> VaultKind {
        VaultKind::AwsIamSso
    }

    async fn unlock(&self, _passphrase: Option<&SecretValue>, _silent: bool) -> Result<()> {
        Ok(())
    }

    /// Sso session state is checked by the exchange itself
    async fn is_unlocked(&self) -> bool {
        true
    }

    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        Ok(req
            .exid
            .filter(|p| !p.is_empty())
            .map(|profile| Stored::new(SecretValue::new(profile))))
    }

    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        match req.exid {
            Some(profile) if !profile.is_empty() => Ok(()),
            _ => Err(KeyrackError::InvalidInput(format!(
                "{} in aws.iam.sso needs --exid <aws profile>",
                req.slug
            ))),
        }
    }

    async fn del(&self, _slug: &Slug, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_profile_reference() {
        let slug: Slug = "acme.prod.AWS".parse().unwrap();
        let got = AwsSsoVault
            .get(VaultGet {
                slug: &slug,
                exid: Some("acme-prod"),
                vault_recipient: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.value.expose(), "acme-prod");

        let none = AwsSsoVault
            .get(VaultGet {
                slug: &slug,
                exid: None,
                vault_recipient: None,
            })
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
