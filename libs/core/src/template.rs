//! Placeholder substitution for per-contact message text.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::types::Contact;

static PLACEHOLDER: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z_]+)\}\}"));

/// Keys substituted by [`render`]; anything else is left untouched.
pub const KNOWN_FIELDS: [&str; 6] = [
    "name",
    "company",
    "email",
    "mobile",
    "interestedArea",
    "contactType",
];

/// Substitutes contact fields into `template` in a single pass.
///
/// Missing values become empty strings. Substituted values are never re-scanned.
///
/// ```
/// use wa_core::{Contact, template::render};
///
/// let contact = Contact::with_mobile("9876543210").named("Asha");
/// assert_eq!(render("Hi {{name}} ({{company}}) {{unknown}}", &contact), "Hi Asha () {{unknown}}");
/// ```
pub fn render(template: &str, contact: &Contact) -> String {
    let Ok(re) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };
    let rendered: Cow<'_, str> = re.replace_all(template, |caps: &Captures<'_>| {
        let key = &caps[1];
        if KNOWN_FIELDS.contains(&key) {
            contact.field(key).unwrap_or_default().to_string()
        } else {
            caps[0].to_string()
        }
    });
    rendered.into_owned()
}

/// Joins rendered text with an optional link line.
pub fn compose_message(text: Option<&str>, url: Option<&str>) -> Option<String> {
    let text = text.filter(|t| !t.is_empty());
    let url = url.map(str::trim).filter(|u| !u.is_empty());
    match (text, url) {
        (Some(text), Some(url)) => Some(format!("{text}\n\n🔗 {url}")),
        (None, Some(url)) => Some(format!("🔗 {url}")),
        (Some(text), None) => Some(text.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn full_contact() -> Contact {
        Contact {
            name: Some("Asha".into()),
            mobile: "9876543210".into(),
            company: Some("Sunrise".into()),
            email: Some("asha@example.com".into()),
            interested_area: Some("Solar".into()),
            contact_type: Some("lead".into()),
            ..Contact::default()
        }
    }

    #[test]
    fn substitutes_every_known_field() {
        let out = render(
            "{{name}}|{{company}}|{{email}}|{{mobile}}|{{interestedArea}}|{{contactType}}",
            &full_contact(),
        );
        assert_eq!(out, "Asha|Sunrise|asha@example.com|9876543210|Solar|lead");
    }

    #[test]
    fn repeated_placeholders_are_all_replaced() {
        let out = render("{{name}}, {{name}}!", &full_contact());
        assert_eq!(out, "Asha, Asha!");
    }

    #[test]
    fn missing_values_render_empty() {
        let contact = Contact::with_mobile("1");
        assert_eq!(render("Dear {{name}},", &contact), "Dear ,");
    }

    #[test]
    fn values_are_not_rescanned() {
        let mut contact = full_contact();
        contact.name = Some("{{company}}".into());
        assert_eq!(render("{{name}}", &contact), "{{company}}");
    }

    #[test]
    fn malformed_placeholders_survive() {
        let contact = full_contact();
        assert_eq!(render("{{ name }} {name} {{name", &contact), "{{ name }} {name} {{name");
    }

    #[test]
    fn compose_appends_link_line() {
        assert_eq!(
            compose_message(Some("Hello"), Some("https://x.io")).as_deref(),
            Some("Hello\n\n🔗 https://x.io")
        );
        assert_eq!(
            compose_message(None, Some(" https://x.io ")).as_deref(),
            Some("🔗 https://x.io")
        );
        assert_eq!(compose_message(Some("Hello"), Some("")).as_deref(), Some("Hello"));
        assert_eq!(compose_message(Some(""), None), None);
    }

    proptest! {
        #[test]
        fn placeholder_free_text_is_unchanged(text in "[^{}]*") {
            let contact = full_contact();
            prop_assert_eq!(render(&text, &contact), text.clone());
        }

        #[test]
        fn render_is_idempotent_without_braces_in_values(
            name in "[A-Za-z ]{0,12}",
            tail in "[a-z ]{0,20}",
        ) {
            let contact = Contact::with_mobile("9876543210").named(name);
            let template = format!("Hi {{{{name}}}} {tail}");
            let once = render(&template, &contact);
            prop_assert_eq!(render(&once, &contact), once.clone());
        }
    }
}
