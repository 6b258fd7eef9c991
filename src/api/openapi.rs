use super::handlers::{admin, health, me, sessions};
use crate::error::ErrorBody;
use utoipa::{
    openapi::{Contact, Info, InfoBuilder, License},
    OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        sessions::create,
        sessions::list,
        sessions::extend,
        sessions::revoke_current,
        sessions::revoke,
        sessions::revoke_all,
        me::me,
        me::change_password,
        admin::list_users,
        admin::approve_user,
        admin::suspend_user,
        admin::user_sessions,
        admin::revoke_user_sessions,
        admin::delete_user,
        admin::stats,
    ),
    components(schemas(ErrorBody)),
    tags(
        (name = "health", description = "Liveness and dependency checks"),
        (name = "sessions", description = "Session cookie lifecycle"),
        (name = "me", description = "The authenticated caller"),
        (name = "admin", description = "User and session administration"),
    )
)]
struct ApiDoc;

/// `OpenAPI` document for the local routes. Proxied paths are not described.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.info = cargo_info();
    doc
}

// Title, version, contact and license come from Cargo.toml.
fn cargo_info() -> Info {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = env!("CARGO_PKG_AUTHORS")
        .split(':')
        .map(str::trim)
        .find(|author| !author.is_empty())
        .and_then(contact_from_author);

    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|id| {
        let mut license = License::new(id);
        license.identifier = Some(id.to_string());
        license
    });

    info
}

fn non_empty(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

// "Name <email>", "Name" or "<email>"
fn contact_from_author(author: &str) -> Option<Contact> {
    let (name, email) = match author.split_once('<') {
        Some((name, rest)) => (name.trim(), rest.trim_end_matches('>').trim()),
        None => (author.trim(), ""),
    };
    if name.is_empty() && email.is_empty() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = Some(name.to_string()).filter(|name| !name.is_empty());
    contact.email = Some(email.to_string()).filter(|email| !email.is_empty());
    Some(contact)
}
