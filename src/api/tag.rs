//! Resolve user tags to their canonical names.

use super::data::{Tag, TagAlias};
use super::{url, ApiClient, ApiError, Credentials};

/// The modifiers a tag may carry, in the order they are checked.
/// `~` means fuzzy (OR), `-` means negation.
const MODIFIERS: [char; 2] = ['~', '-'];

/// Split one leading modifier off `tag`.
///
/// At most one modifier is recognized: `"~-cat"` is `("~", "-cat")`.
#[inline]
fn split_modifier(tag: &str) -> (&str, &str) {
    match tag.chars().next() {
        Some(first) if MODIFIERS.contains(&first) => tag.split_at(first.len_utf8()),
        _ => ("", tag),
    }
}

impl ApiClient {
    /// Resolve a user tag to its canonical form, following at most one alias hop.
    ///
    /// - Namespaced tags (containing `:`, e.g. `rating:safe`) are returned unchanged
    ///   without any request.
    /// - One leading `~` or `-` modifier is stripped before the lookup and put back on the result.
    /// - A wildcard tag (containing `*`) is canonical as soon as it matches anything.
    /// - An exact match in the tag index is canonical.
    /// - Otherwise the approved alias whose source is the tag is followed once,
    ///   and its target's name is returned. Chained aliases are not followed further.
    ///
    /// # Errors
    ///
    /// [`ApiError::UnknownTag`] if the tag has neither an exact match nor an approved alias.
    /// This is a user input error, callers usually abort the whole run.
    ///
    /// Any non-success status is returned as [`ApiError::Http`].
    pub async fn resolve_tag_alias(
        &self,
        user_tag: &str,
        credentials: &Credentials,
    ) -> Result<String, ApiError> {
        if user_tag.contains(':') {
            return Ok(user_tag.to_owned());
        }

        let (prefix, tag) = split_modifier(user_tag);
        if tag.is_empty() {
            tracing::error!("The tag {user_tag:?} is empty");
            return Err(ApiError::UnknownTag(user_tag.to_owned()));
        }

        let tags = self.lookup_tags(tag, credentials).await?;
        if tag.contains('*') && !tags.is_empty() {
            return Ok(user_tag.to_owned());
        }
        if tags.iter().any(|found| found.name == tag) {
            return Ok(user_tag.to_owned());
        }

        let aliases = self.lookup_aliases(tag, credentials).await?;
        if let Some(alias) = aliases.iter().find(|alias| alias.name == tag) {
            let target = self.get_tag_by_id(alias.alias_id, credentials).await?;
            tracing::info!("Tag aliased: {prefix}{tag} -> {prefix}{}", target.name);
            return Ok(format!("{prefix}{}", target.name));
        }

        tracing::error!("The tag {user_tag} is spelled incorrectly or does not exist.");
        Err(ApiError::UnknownTag(user_tag.to_owned()))
    }

    /// Resolve every tag of `user_tags` in order with [`Self::resolve_tag_alias`].
    ///
    /// # Errors
    ///
    /// Stops at the first tag that fails to resolve.
    pub async fn resolve_tags<S>(
        &self,
        user_tags: &[S],
        credentials: &Credentials,
    ) -> Result<Vec<String>, ApiError>
    where
        S: AsRef<str>,
    {
        let mut resolved = Vec::with_capacity(user_tags.len());
        for user_tag in user_tags {
            resolved.push(self.resolve_tag_alias(user_tag.as_ref(), credentials).await?);
        }
        Ok(resolved)
    }

    async fn lookup_tags(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> Result<Vec<Tag>, ApiError> {
        let mut form = Vec::from(credentials.form());
        form.push(("name", name));

        let response = self.post_form(url::TAG_INDEX, &form).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn lookup_aliases(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> Result<Vec<TagAlias>, ApiError> {
        let mut form = Vec::from(credentials.form());
        form.push(("approved", "true"));
        form.push(("query", name));

        let response = self.post_form(url::TAG_ALIAS_INDEX, &form).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn get_tag_by_id(&self, id: u64, credentials: &Credentials) -> Result<Tag, ApiError> {
        let id = id.to_string();
        let mut form = Vec::from(credentials.form());
        form.push(("id", id.as_str()));

        let response = self.post_form(url::TAG_SHOW, &form).await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{body_string, body_string_contains, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::api::tests::{api_for, credentials};
    use crate::limiter::MIN_INTERVAL;

    /// A mock tag index: `cats` exists, `cat` is an approved alias of `cats` (id 42),
    /// and `kitten` is an approved alias of `cat`.
    async fn tag_index() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(path("/tag/index.json"))
            .and(body_string_contains("name=cats"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 42, "name": "cats"}])),
            )
            .mount(&server)
            .await;
        Mock::given(path("/tag/index.json"))
            .and(body_string_contains("name=ca*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 42, "name": "cats"},
                {"id": 43, "name": "caterpillar"},
            ])))
            .mount(&server)
            .await;
        // anything else has no exact match
        Mock::given(path("/tag/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .with_priority(10)
            .mount(&server)
            .await;

        Mock::given(path("/tag_alias/index.json"))
            .and(body_string(
                "login=user&password_hash=secret&approved=true&query=cat",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "cat", "alias_id": 42, "pending": false},
            ])))
            .mount(&server)
            .await;
        Mock::given(path("/tag_alias/index.json"))
            .and(body_string_contains("query=kitten"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 2, "name": "kitten", "alias_id": 41, "pending": false},
            ])))
            .mount(&server)
            .await;
        Mock::given(path("/tag_alias/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .with_priority(10)
            .mount(&server)
            .await;

        Mock::given(path("/tag/show.json"))
            .and(body_string_contains("id=42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": "cats"})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/tag/show.json"))
            .and(body_string_contains("id=41"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 41, "name": "cat"})),
            )
            .mount(&server)
            .await;

        server
    }

    #[test]
    fn test_split_modifier() {
        assert_eq!(split_modifier("cat"), ("", "cat"));
        assert_eq!(split_modifier("~cat"), ("~", "cat"));
        assert_eq!(split_modifier("-cat"), ("-", "cat"));
        assert_eq!(split_modifier("~-cat"), ("~", "-cat"));
        assert_eq!(split_modifier("-"), ("-", ""));
        assert_eq!(split_modifier(""), ("", ""));
    }

    #[tokio::test]
    async fn test_namespaced_tag_is_unchanged() {
        let server = tag_index().await;
        let api = api_for(&server);

        for user_tag in ["rating:safe", "-rating:explicit", "~id:*"] {
            let tag = api.resolve_tag_alias(user_tag, &credentials()).await.unwrap();
            assert_eq!(tag, user_tag);
        }

        let requests = server.received_requests().await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_exact_match_keeps_modifier() {
        let server = tag_index().await;
        let api = api_for(&server);

        for user_tag in ["cats", "~cats", "-cats"] {
            let tag = api.resolve_tag_alias(user_tag, &credentials()).await.unwrap();
            assert_eq!(tag, user_tag);
        }
    }

    #[tokio::test]
    async fn test_alias_is_followed() {
        let server = tag_index().await;
        let api = api_for(&server);

        let tag = api.resolve_tag_alias("cat", &credentials()).await.unwrap();
        assert_eq!(tag, "cats");
        let tag = api.resolve_tag_alias("-cat", &credentials()).await.unwrap();
        assert_eq!(tag, "-cats");
        let tag = api.resolve_tag_alias("~cat", &credentials()).await.unwrap();
        assert_eq!(tag, "~cats");
    }

    #[tokio::test]
    async fn test_only_one_alias_hop() {
        let server = tag_index().await;
        let api = api_for(&server);

        // kitten -> cat -> cats, but only the first hop is followed
        let tag = api.resolve_tag_alias("kitten", &credentials()).await.unwrap();
        assert_eq!(tag, "cat");
    }

    #[tokio::test]
    async fn test_wildcard_is_unchanged() {
        let server = tag_index().await;
        let api = api_for(&server);

        let tag = api.resolve_tag_alias("-ca*", &credentials()).await.unwrap();
        assert_eq!(tag, "-ca*");

        // a wildcard matching nothing falls through to the alias table, and fails
        let err = api.resolve_tag_alias("zz*", &credentials()).await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownTag(tag) if tag == "zz*"));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let server = tag_index().await;
        let api = api_for(&server);

        let err = api.resolve_tag_alias("~dgo", &credentials()).await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownTag(tag) if tag == "~dgo"));

        let err = api.resolve_tag_alias("-", &credentials()).await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownTag(tag) if tag == "-"));
    }

    #[tokio::test]
    async fn test_resolve_tags_stops_at_unknown() {
        let server = tag_index().await;
        let api = api_for(&server);

        let tags = api
            .resolve_tags(&["cat", "-cats", "rating:safe"], &credentials())
            .await
            .unwrap();
        assert_eq!(tags, ["cats", "-cats", "rating:safe"]);

        let err = api
            .resolve_tags(&["cat", "dgo", "cats"], &credentials())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownTag(tag) if tag == "dgo"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(path("/tag/index.json"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = api_for(&server)
            .resolve_tag_alias("cat", &credentials())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Http(_)));
    }

    #[tokio::test]
    async fn test_alias_requests_are_paced() {
        let server = tag_index().await;
        let api = api_for(&server);

        let start = std::time::Instant::now();
        let tag = api.resolve_tag_alias("cat", &credentials()).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(tag, "cats");
        // exact lookup, alias lookup, tag by id: two gaps between three requests
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(elapsed >= 2 * MIN_INTERVAL, "{elapsed:?}");
    }
}
