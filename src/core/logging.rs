//! Logging utilities with request context support.
//!
//! Task-local request id, application id and endpoint label let log lines and
//! metrics carry dispatch context without threading it through every call.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the application being served.
    pub static APP_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the endpoint currently being attempted.
    pub static ENDPOINT_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current application id from context, if set.
pub fn get_app_id() -> String {
    APP_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current endpoint label from context, if set.
pub fn get_endpoint_context() -> String {
    ENDPOINT_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Whether a `LOG_FORMAT` value selects one JSON object per log event.
pub fn wants_json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

/// Create a tracing span for one endpoint attempt.
#[macro_export]
macro_rules! endpoint_span {
    ($name:expr, $endpoint:expr) => {
        tracing::info_span!($name, endpoint = %$endpoint)
    };
}

/// Execute an async block with request context (request_id, app_id, endpoint).
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, app_id, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $app_id:expr, $endpoint:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::APP_ID
                    .scope($app_id, async {
                        $crate::core::logging::ENDPOINT_CONTEXT
                            .scope($endpoint, $body)
                            .await
                    })
                    .await
            })
            .await
    };
    // Version without endpoint context
    ($request_id:expr, $app_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::APP_ID.scope($app_id, $body).await
            })
            .await
    };
}
