//! OpenAPI/Utoipa configuration.

use crate::api::{health::MISC_TAG, users::USERS_TAG};
use crate::oauth2::OAUTH2_TAG;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, OAuth2, Password, Scopes, SecurityScheme},
};

/// Security schemes shown in the documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let bearer = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .description(Some(
                    "Access token issued by `/oauth2/token`. User endpoints act inside the token's client.",
                ))
                .build();
            components.add_security_scheme("Bearer", SecurityScheme::Http(bearer));

            let oauth2 = OAuth2::new([utoipa::openapi::security::Flow::Password(
                Password::new(
                    "/oauth2/token",
                    Scopes::from_iter([
                        ("root", "Full access for the client's own identities"),
                        ("offline", "Issue a refresh token"),
                    ]),
                ),
            )]);
            components.add_security_scheme("OAuth2", SecurityScheme::OAuth2(oauth2));
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "OAuth Identity Service API",
        version = "1.0.0",
        description = "OAuth2 token issuance and identity management for first-party clients."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = OAUTH2_TAG, description = "OAuth2 protocol endpoints"),
        (name = USERS_TAG, description = "Identity management endpoints")
    )
)]
pub struct ApiDoc;
