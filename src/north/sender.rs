//! North-bound HTTP transport primitive.

/// Transport-level failure; HTTP status handling is the caller's concern.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0}")]
    Transport(String),
}

/// The send primitive the emitter and send task are written against:
/// verb, path, headers and body in; status and body out.
pub trait Sender: Send {
    fn send(
        &mut self,
        verb: &str,
        path: &str,
        headers: &[(String, String)],
        body: &str,
    ) -> Result<(u16, String), SendError>;
}

/// Blocking HTTP implementation of [`Sender`].
pub struct HttpSender {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpSender {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Sender for HttpSender {
    fn send(
        &mut self,
        verb: &str,
        path: &str,
        headers: &[(String, String)],
        body: &str,
    ) -> Result<(u16, String), SendError> {
        let method = reqwest::Method::from_bytes(verb.as_bytes())
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut request = self.client.request(method, url).body(body.to_string());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Ok((status, body))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted sender recording every request.

    use super::{SendError, Sender};

    #[derive(Debug, Clone)]
    pub(crate) struct SentRequest {
        pub verb: String,
        pub path: String,
        pub body: String,
    }

    #[derive(Default)]
    pub(crate) struct MockSender {
        pub requests: Vec<SentRequest>,
        pub responses: std::collections::VecDeque<Result<(u16, String), String>>,
    }

    impl MockSender {
        pub fn respond_with(&mut self, status: u16) {
            self.responses.push_back(Ok((status, String::new())));
        }

        pub fn fail_with(&mut self, message: &str) {
            self.responses.push_back(Err(message.to_string()));
        }
    }

    impl Sender for MockSender {
        fn send(
            &mut self,
            verb: &str,
            path: &str,
            _headers: &[(String, String)],
            body: &str,
        ) -> Result<(u16, String), SendError> {
            self.requests.push(SentRequest {
                verb: verb.to_string(),
                path: path.to_string(),
                body: body.to_string(),
            });
            match self.responses.pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(SendError::Transport(message)),
                None => Ok((204, String::new())),
            }
        }
    }
}
