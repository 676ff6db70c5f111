use super::types::{Asset, SystemUser, User};
use crate::configuration::{AssetConfig, Config, TokenConfig};
use crate::error_handling::types::ResolveError;
use log::debug;

/// Decides which backend an operator reaches and with which credential.
///
/// Implementations must be cheap to call from async code: they are consulted synchronously
/// on the connection task.
pub trait AssetResolver: Send + Sync {
    /// Maps a username announced during negotiation to an operator identity.
    fn authenticate(&self, username: &str) -> Result<User, ResolveError>;

    /// Picks the asset designated by `selector` (hostname, ip or id) for `user`.
    ///
    /// An empty selector is accepted when the user is allowed on exactly one asset.
    fn resolve(&self, user: &User, selector: &str) -> Result<(Asset, SystemUser), ResolveError>;

    /// Redeems a pre-issued token into the identity and target it was bound to.
    fn resolve_token(&self, token: &str) -> Result<(User, Asset, SystemUser), ResolveError>;
}

/// Inventory loaded once from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    assets: Vec<AssetConfig>,
    tokens: Vec<TokenConfig>,
}

impl StaticInventory {
    pub fn new(assets: Vec<AssetConfig>, tokens: Vec<TokenConfig>) -> Self {
        Self { assets, tokens }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.assets.clone(), config.tokens.clone())
    }

    fn allowed(entry: &AssetConfig, username: &str) -> bool {
        entry
            .allowed_users
            .iter()
            .any(|allowed| allowed == "*" || allowed == username)
    }

    fn to_asset(entry: &AssetConfig) -> (Asset, SystemUser) {
        (
            Asset {
                id: entry.hostname.clone(),
                hostname: entry.hostname.clone(),
                ip: entry.ip.clone(),
                port: entry.port,
            },
            SystemUser {
                username: entry.system_user.clone(),
            },
        )
    }
}

impl AssetResolver for StaticInventory {
    fn authenticate(&self, username: &str) -> Result<User, ResolveError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ResolveError::UnknownUser(String::new()));
        }
        if !self.assets.iter().any(|a| Self::allowed(a, username)) {
            return Err(ResolveError::UnknownUser(username.to_string()));
        }
        Ok(User::new(username))
    }

    fn resolve(&self, user: &User, selector: &str) -> Result<(Asset, SystemUser), ResolveError> {
        let selector = selector.trim();

        if selector.is_empty() {
            let mut permitted = self
                .assets
                .iter()
                .filter(|a| Self::allowed(a, &user.username));
            return match (permitted.next(), permitted.next()) {
                (Some(only), None) => Ok(Self::to_asset(only)),
                _ => Err(ResolveError::UnknownAsset(String::new())),
            };
        }

        let entry = self
            .assets
            .iter()
            .find(|a| a.hostname == selector || a.ip == selector)
            .ok_or_else(|| ResolveError::UnknownAsset(selector.to_string()))?;

        if !Self::allowed(entry, &user.username) {
            return Err(ResolveError::PermissionDenied {
                user: user.username.clone(),
                asset: entry.hostname.clone(),
            });
        }

        debug!("{} resolved {} to {}", user, selector, entry.ip);
        Ok(Self::to_asset(entry))
    }

    fn resolve_token(&self, token: &str) -> Result<(User, Asset, SystemUser), ResolveError> {
        let entry = self
            .tokens
            .iter()
            .find(|t| !token.is_empty() && t.token == token)
            .ok_or(ResolveError::InvalidToken)?;

        let user = User::new(&entry.user);
        let (asset, system_user) = self.resolve(&user, &entry.asset)?;
        Ok((user, asset, system_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> StaticInventory {
        StaticInventory::new(
            vec![
                AssetConfig {
                    hostname: "web01".into(),
                    ip: "10.0.0.5".into(),
                    port: 22,
                    system_user: "root".into(),
                    allowed_users: vec!["alice".into()],
                },
                AssetConfig {
                    hostname: "db01".into(),
                    ip: "10.0.0.6".into(),
                    port: 2022,
                    system_user: "dba".into(),
                    allowed_users: vec!["*".into()],
                },
            ],
            vec![
                TokenConfig {
                    token: "t-1".into(),
                    user: "alice".into(),
                    asset: "web01".into(),
                },
                TokenConfig {
                    token: "t-2".into(),
                    user: "bob".into(),
                    asset: "web01".into(),
                },
            ],
        )
    }

    #[test]
    fn test_authenticate() {
        let inventory = inventory();
        assert_eq!(inventory.authenticate("alice").unwrap().username, "alice");
        // wildcard asset admits anyone
        assert!(inventory.authenticate("bob").is_ok());
        assert_eq!(
            inventory.authenticate("  "),
            Err(ResolveError::UnknownUser(String::new()))
        );
    }

    #[test]
    fn test_resolve_by_hostname_and_ip() {
        let inventory = inventory();
        let alice = User::new("alice");

        let (asset, su) = inventory.resolve(&alice, "web01").unwrap();
        assert_eq!(asset.ip, "10.0.0.5");
        assert_eq!(su.username, "root");

        let (asset, su) = inventory.resolve(&alice, "10.0.0.6").unwrap();
        assert_eq!(asset.hostname, "db01");
        assert_eq!(asset.port, 2022);
        assert_eq!(su.username, "dba");
    }

    #[test]
    fn test_resolve_denied_and_unknown() {
        let inventory = inventory();
        let bob = User::new("bob");

        assert_eq!(
            inventory.resolve(&bob, "web01"),
            Err(ResolveError::PermissionDenied {
                user: "bob".into(),
                asset: "web01".into()
            })
        );
        assert_eq!(
            inventory.resolve(&bob, "nope"),
            Err(ResolveError::UnknownAsset("nope".into()))
        );
    }

    #[test]
    fn test_empty_selector() {
        let inventory = inventory();
        // bob only reaches db01
        let (asset, _) = inventory.resolve(&User::new("bob"), "").unwrap();
        assert_eq!(asset.hostname, "db01");
        // alice reaches both, so the selector is ambiguous
        assert!(inventory.resolve(&User::new("alice"), "").is_err());
    }

    #[test]
    fn test_tokens() {
        let inventory = inventory();
        let (user, asset, _) = inventory.resolve_token("t-1").unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(asset.hostname, "web01");

        assert!(matches!(
            inventory.resolve_token("t-2"),
            Err(ResolveError::PermissionDenied { .. })
        ));
        assert_eq!(inventory.resolve_token(""), Err(ResolveError::InvalidToken));
        assert_eq!(inventory.resolve_token("x"), Err(ResolveError::InvalidToken));
    }
}
