use anyhow::{Context, Result};
use regex::Regex;

/// Decides whether a request is cacheable at all. Both restrictions must
/// pass; an empty list matches everything.
pub struct Admission {
    methods: Vec<String>,
    routes: Vec<Regex>,
}

impl Admission {
    pub fn new(methods: &[String], routes: &[String]) -> Result<Self> {
        let methods = methods.iter().map(|m| m.to_uppercase()).collect();
        let mut compiled = Vec::with_capacity(routes.len());
        for expr in routes {
            let re = Regex::new(expr).with_context(|| format!("restrict_route_regexp: '{expr}'"))?;
            compiled.push(re);
        }
        Ok(Self {
            methods,
            routes: compiled,
        })
    }

    pub fn must_cache(&self, method: &str, uri: &str) -> bool {
        self.match_method(method) && self.match_route(uri)
    }

    fn match_method(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods.iter().any(|m| m == method)
    }

    fn match_route(&self, uri: &str) -> bool {
        if self.routes.is_empty() {
            return true;
        }
        self.routes.iter().any(|re| re.is_match(uri))
    }
}
