//! Method validation and strategy selection.

use crate::config::QueryConfig;
use crate::error::Result;
use crate::graphrag::domain::{QueryRequest, SearchMethod};

use super::SearchStrategy;

#[derive(Debug, Clone)]
pub struct QueryRouter {
    config: QueryConfig,
}

impl QueryRouter {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    /// `None` selects local search. Any supplied value must name one of the
    /// four methods; an empty or unknown value is an `UnsupportedMethod`
    /// error, never a fallback.
    pub fn resolve(method: Option<&str>) -> Result<SearchMethod> {
        match method {
            None => Ok(SearchMethod::Local),
            Some(value) => value.parse(),
        }
    }

    pub fn route(&self, request: &QueryRequest) -> Result<SearchStrategy> {
        let method = Self::resolve(request.method.as_deref())?;
        Ok(SearchStrategy::for_method(method, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn router() -> QueryRouter {
        QueryRouter::new(AppConfig::default().query)
    }

    #[test]
    fn test_omitted_method_defaults_to_local() {
        let strategy = router().route(&QueryRequest::new("q")).unwrap();
        assert_eq!(strategy.method(), SearchMethod::Local);
    }

    #[test]
    fn test_each_method_routes() {
        for method in SearchMethod::ALL {
            let strategy = router()
                .route(&QueryRequest::new("q").with_method(method.as_str()))
                .unwrap();
            assert_eq!(strategy.method(), method);
        }
    }

    #[test]
    fn test_invalid_methods_are_rejected() {
        for bad in ["bogus", "", "  ", "local-ish"] {
            let err = router()
                .route(&QueryRequest::new("q").with_method(bad))
                .unwrap_err();
            assert_eq!(err.kind(), "unsupported_method", "{bad:?}");
        }
    }
}
