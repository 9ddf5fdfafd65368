//! Lifecycle callbacks
//!
//! Callbacks run inside the per-request task in registration order. HTML
//! handlers are `(selector, handler)` pairs run against `text/html` bodies
//! after the response callbacks.

use crate::engine::request::{FetchFailure, FetchRequest, FetchResponse};
use crate::engine::EngineError;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;

pub type RequestHook = Arc<dyn Fn(&FetchRequest) + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&FetchResponse) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&FetchFailure) + Send + Sync>;

/// Receives every element matching a registered selector
pub trait HtmlHandler: Send + Sync {
    fn handle(&self, element: &HtmlElement<'_>);
}

impl<F> HtmlHandler for F
where
    F: Fn(&HtmlElement<'_>) + Send + Sync,
{
    fn handle(&self, element: &HtmlElement<'_>) {
        self(element)
    }
}

/// One matched element, borrowed from the parsed document
pub struct HtmlElement<'a> {
    element: ElementRef<'a>,
    response: &'a FetchResponse,
    index: usize,
}

impl<'a> HtmlElement<'a> {
    pub fn name(&self) -> &str {
        self.element.value().name()
    }

    /// Concatenated text of the element and its descendants
    pub fn text(&self) -> String {
        self.element.text().collect()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.value().attr(name)
    }

    pub fn inner_html(&self) -> String {
        self.element.inner_html()
    }

    /// Position among the elements matched by the same selector
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn request(&self) -> &FetchRequest {
        &self.response.request
    }

    /// Resolves an attribute value against the page URL
    pub fn absolute_url(&self, attr: &str) -> Option<url::Url> {
        self.attr(attr)
            .and_then(|href| self.response.request.url.join(href).ok())
    }
}

/// Registered callbacks
#[derive(Clone, Default)]
pub struct Hooks {
    request: Vec<RequestHook>,
    response: Vec<ResponseHook>,
    error: Vec<ErrorHook>,
    html: Vec<(Selector, Arc<dyn HtmlHandler>)>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(&mut self, hook: impl Fn(&FetchRequest) + Send + Sync + 'static) -> &mut Self {
        self.request.push(Arc::new(hook));
        self
    }

    pub fn on_response(
        &mut self,
        hook: impl Fn(&FetchResponse) + Send + Sync + 'static,
    ) -> &mut Self {
        self.response.push(Arc::new(hook));
        self
    }

    pub fn on_error(&mut self, hook: impl Fn(&FetchFailure) + Send + Sync + 'static) -> &mut Self {
        self.error.push(Arc::new(hook));
        self
    }

    /// Registers a handler for elements matching a CSS selector
    pub fn on_html(
        &mut self,
        selector: &str,
        handler: impl HtmlHandler + 'static,
    ) -> Result<&mut Self, EngineError> {
        let parsed = Selector::parse(selector)
            .map_err(|e| EngineError::InvalidSelector(format!("{}: {:?}", selector, e)))?;
        self.html.push((parsed, Arc::new(handler)));
        Ok(self)
    }

    /// Appends every callback of `other` after the ones already registered
    pub fn extend(&mut self, other: Hooks) {
        self.request.extend(other.request);
        self.response.extend(other.response);
        self.error.extend(other.error);
        self.html.extend(other.html);
    }

    pub(crate) fn fire_request(&self, request: &FetchRequest) {
        for hook in &self.request {
            hook(request);
        }
    }

    pub(crate) fn fire_response(&self, response: &FetchResponse) {
        for hook in &self.response {
            hook(response);
        }
    }

    pub(crate) fn fire_error(&self, failure: &FetchFailure) {
        for hook in &self.error {
            hook(failure);
        }
    }

    pub(crate) fn has_html_handlers(&self) -> bool {
        !self.html.is_empty()
    }

    /// Parses the body and runs the HTML handlers
    ///
    /// Synchronous: the parsed document is not `Send` and must not live across
    /// an await point.
    pub(crate) fn run_html(&self, response: &FetchResponse) {
        let document = Html::parse_document(&response.text());
        for (selector, handler) in &self.html {
            for (index, element) in document.select(selector).enumerate() {
                handler.handle(&HtmlElement {
                    element,
                    response,
                    index,
                });
            }
        }
    }
}

/// Extracts the trimmed `<title>` text of an HTML document
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::RawResponse;
    use std::sync::Mutex;

    fn html_response(body: &str) -> FetchResponse {
        let request = FetchRequest::parse("http://x/dir/page").unwrap();
        FetchResponse::from_raw(
            request,
            RawResponse::new(200, body).with_content_type("text/html; charset=utf-8"),
        )
    }

    #[test]
    fn test_html_handlers_see_matches_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut hooks = Hooks::new();
        hooks
            .on_html("a[href]", move |el: &HtmlElement<'_>| {
                let url = el.absolute_url("href").map(|u| u.to_string());
                sink.lock().unwrap().push((el.index(), el.text(), url));
            })
            .unwrap();

        let response = html_response(
            r#"<html><body><a href="/one">One</a><a href="two">Two</a><a>none</a></body></html>"#,
        );
        hooks.run_html(&response);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (0, "One".to_string(), Some("http://x/one".to_string())),
                (1, "Two".to_string(), Some("http://x/dir/two".to_string())),
            ]
        );
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let mut hooks = Hooks::new();
        let result = hooks.on_html("a[", |_: &HtmlElement<'_>| {});
        assert!(matches!(result, Err(EngineError::InvalidSelector(_))));
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());

        let mut hooks = Hooks::new();
        hooks.on_request(move |_| a.lock().unwrap().push("first"));
        let mut extra = Hooks::new();
        extra.on_request(move |_| b.lock().unwrap().push("second"));
        hooks.extend(extra);

        hooks.fire_request(&FetchRequest::parse("http://x/1").unwrap());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("<html><head><title> Home </title></head></html>"),
            Some("Home".to_string())
        );
        assert_eq!(extract_title("<p>no title</p>"), None);
    }
}
