use pv_wire::AuthCode;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuthedIdentity {
    pub player: Uuid,
    pub name: String,
}

pub trait AuthProvider: Send + Sync + 'static {
    fn authenticate(
        &self,
        player: Uuid,
        name: &str,
        token: Option<&str>,
    ) -> Result<AuthedIdentity, AuthCode>;
}

/// Accepts any non-empty name; token is ignored. Real deployments plug in a
/// provider that checks the token against the game platform.
#[derive(Debug, Clone)]
pub struct DevAuthProvider;

impl AuthProvider for DevAuthProvider {
    fn authenticate(
        &self,
        player: Uuid,
        name: &str,
        _token: Option<&str>,
    ) -> Result<AuthedIdentity, AuthCode> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthCode::InvalidCredentials);
        }
        Ok(AuthedIdentity { player, name: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_rejected() {
        let err = DevAuthProvider.authenticate(Uuid::new_v4(), "  ", None).unwrap_err();
        assert_eq!(err, AuthCode::InvalidCredentials);
    }

    #[test]
    fn name_is_trimmed() {
        let id = DevAuthProvider.authenticate(Uuid::new_v4(), " alice ", None).unwrap();
        assert_eq!(id.name, "alice");
    }
}
