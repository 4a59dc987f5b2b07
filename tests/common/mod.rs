//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rampload::client::{HttpClient, HttpRequest, HttpResponse};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// In-process API double. Routes on method and path, records every request
/// and answers 404 for anything unrouted.
#[derive(Default)]
pub struct RoutedClient {
    routes: HashMap<(Method, String), Responder>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RoutedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(mut self, method: Method, path: &str, responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes
            .insert((method, path.to_string()), Box::new(responder));
        self
    }

    pub fn respond(self, method: Method, path: &str, status: u16, body: &'static str) -> Self {
        self.route(method, path, move |_| HttpResponse::new(status, body))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && path_of(&r.url) == path)
            .count()
    }
}

#[async_trait]
impl HttpClient for RoutedClient {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        self.requests.lock().unwrap().push(request.clone());
        let key = (request.method.clone(), path_of(&request.url));
        match self.routes.get(&key) {
            Some(responder) => responder(&request),
            None => HttpResponse::new(404, "not found"),
        }
    }
}

pub fn path_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_default()
}
