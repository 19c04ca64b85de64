use utoipa::openapi::security::HttpAuthScheme;
use utoipa::OpenApi;

use crate::quota::Admit;
use crate::types::{ErrorResponse, UsageStats};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::handle_text,
        crate::server::usage_handler,
    ),
    components(
        schemas(
            Admit,
            ErrorResponse,
            UsageStats,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "wordgate", description = "Daily word quota endpoints")
    ),
    info(
        title = "Wordgate API",
        version = "1.0",
        description = "Per-user daily word quota in front of a text-processing API",
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use utoipa::OpenApi;

    use super::ApiDoc;

    #[test]
    fn documents_every_route() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/text"));
        assert!(doc.paths.paths.contains_key("/usage"));
        let components = doc.components.unwrap();
        assert!(components.security_schemes.contains_key("jwt"));
        assert!(components.schemas.contains_key("UsageStats"));
    }
}
