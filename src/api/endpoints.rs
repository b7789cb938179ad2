//! Fixed REST path table, relative to the configured base URL.

/// Every backend route the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Login,
    TokenRefresh,
    Register,
    Logout,
    Products,
    Categories,
    Cart,
    Profile,
    Addresses,
    Orders,
    Loyalty,
    ChangePassword,
    DeleteAccount,
}

impl Endpoint {
    pub const ALL: [Endpoint; 13] = [
        Endpoint::Login,
        Endpoint::TokenRefresh,
        Endpoint::Register,
        Endpoint::Logout,
        Endpoint::Products,
        Endpoint::Categories,
        Endpoint::Cart,
        Endpoint::Profile,
        Endpoint::Addresses,
        Endpoint::Orders,
        Endpoint::Loyalty,
        Endpoint::ChangePassword,
        Endpoint::DeleteAccount,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Login => "/api/auth/login/",
            Endpoint::TokenRefresh => "/api/auth/token/refresh/",
            Endpoint::Register => "/api/auth/register/",
            Endpoint::Logout => "/api/auth/logout/",
            Endpoint::Products => "/api/products/",
            Endpoint::Categories => "/api/categories/",
            Endpoint::Cart => "/api/cart/",
            Endpoint::Profile => "/api/profile/",
            Endpoint::Addresses => "/api/addresses/",
            Endpoint::Orders => "/api/orders/",
            Endpoint::Loyalty => "/api/loyalty/",
            Endpoint::ChangePassword => "/api/auth/change-password/",
            Endpoint::DeleteAccount => "/api/auth/delete-account/",
        }
    }

    /// Path of one resource under a collection, e.g. `/api/orders/42/`.
    pub fn item(self, id: impl std::fmt::Display) -> String {
        format!("{}{}/", self.path(), urlencoding::encode(&id.to_string()))
    }

    /// Endpoints called without a bearer token. A 401 from these never
    /// triggers a refresh.
    pub fn is_public(self) -> bool {
        matches!(
            self,
            Endpoint::Login | Endpoint::TokenRefresh | Endpoint::Register
        )
    }

    /// Whether `path` targets one of the public endpoints.
    pub fn is_public_path(path: &str) -> bool {
        Endpoint::ALL
            .iter()
            .any(|e| e.is_public() && path.starts_with(e.path()))
    }
}
