//! The request view the cache middleware keys on.

use super::{Headers, Method};

/// An HTTP request as seen by the cache middleware.
///
/// Requests are cheap to clone, which lets the stale-while-revalidate
/// middleware replay one in a background task.
///
/// # Examples
///
/// ```
/// use rcache::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "/api/templates?page=2&sort=new")
///     .with_header("Host", "localhost");
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/api/templates");
/// assert_eq!(request.query_pairs()[0], ("page".to_string(), "2".to_string()));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    headers: Headers,
    query: Option<String>,
}

impl Request {
    /// Builds a request for `target` (a path with an optional `?query`).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            headers: Headers::new(),
            query,
        }
    }

    /// Appends a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the query as `(name, value)` pairs in their original order,
    /// duplicates included. `+` is decoded as a space.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(parse_query_string)
            .unwrap_or_default()
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splits_into_path_and_query() {
        let req = Request::new(Method::Get, "/search?q=rust+cache&page=2").with_header("Host", "example.com");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.headers().get("host"), Some("example.com"));
        assert_eq!(
            req.query_pairs(),
            vec![
                ("q".to_string(), "rust cache".to_string()),
                ("page".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn query_pairs_keep_duplicates_and_bare_names() {
        let req = Request::new(Method::Get, "/x?tag=a&tag=b&flag&");
        assert_eq!(
            req.query_pairs(),
            vec![
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn no_query_means_no_pairs() {
        let req = Request::new(Method::Head, "/");
        assert_eq!(req.path(), "/");
        assert!(req.query_pairs().is_empty());
        assert_eq!(req.clone().method(), &Method::Head);
    }
}
