/// Scripted navigator shared by the unit tests
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use url::Url;

use super::webview::WebViewNavigator;
use crate::error::Result;
use crate::types::Cookie;

pub(crate) struct ScriptedNavigator {
    landings: Mutex<VecDeque<Option<Url>>>,
    cookies: Vec<Cookie>,
    callback: Option<(String, String)>,
    navigated: Mutex<Vec<Url>>,
    closed: Mutex<usize>,
}

impl ScriptedNavigator {
    /// Replays `landings` in order; `None` dismisses the view. Once the script
    /// runs dry the navigator never completes another navigation.
    pub(crate) fn new(landings: Vec<Option<Url>>, cookies: Vec<Cookie>) -> Self {
        Self {
            landings: Mutex::new(landings.into()),
            cookies,
            callback: None,
            navigated: Mutex::new(Vec::new()),
            closed: Mutex::new(0),
        }
    }

    /// Answers any navigation carrying a `state` parameter with a redirect to
    /// `redirect_uri?code=<code>&state=<state>`, like an authorization server.
    pub(crate) fn authorizing(redirect_uri: &str, code: &str) -> Self {
        let mut navigator = Self::new(Vec::new(), Vec::new());
        navigator.callback = Some((redirect_uri.to_string(), code.to_string()));
        navigator
    }

    pub(crate) fn navigated(&self) -> Vec<Url> {
        self.navigated.lock().clone()
    }

    pub(crate) fn closed(&self) -> usize {
        *self.closed.lock()
    }
}

#[async_trait]
impl WebViewNavigator for ScriptedNavigator {
    async fn navigate(&self, uri: &Url) -> Result<()> {
        self.navigated.lock().push(uri.clone());

        if let Some((redirect, code)) = &self.callback {
            let state = uri
                .query_pairs()
                .find(|(key, _)| key == "state")
                .map(|(_, value)| value.into_owned());
            if let Some(state) = state {
                let mut landing = Url::parse(redirect).expect("test redirect URI");
                landing
                    .query_pairs_mut()
                    .append_pair("code", code)
                    .append_pair("state", &state);
                self.landings.lock().push_front(Some(landing));
            }
        }
        Ok(())
    }

    async fn next_navigation(&self) -> Option<Url> {
        let next = self.landings.lock().pop_front();
        match next {
            Some(landing) => landing,
            None => std::future::pending().await,
        }
    }

    async fn cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
        Ok(self
            .cookies
            .iter()
            .filter(|c| c.domain.trim_start_matches('.') == domain || c.domain == domain)
            .cloned()
            .collect())
    }

    async fn close(&self) {
        *self.closed.lock() += 1;
    }
}
