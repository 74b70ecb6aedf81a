//! A minimal module: announces one endpoint, serves tunnelled HTTP, and
//! answers peer pings.
//!
//! Run under an orchestrator (it reads the init blob from stdin):
//!
//! ```sh
//! echo '{"orchestrator_api":"local","module_id":"greeter","env":{},"listen":{"tcp":"127.0.0.1:0"},"security_level":"None"}' \
//!     | cargo run -p pywatt-module --example greeter
//! ```

use std::collections::HashMap;

use pywatt_module::prelude::*;

struct Greeter {
    greeting: String,
}

#[tokio::main]
async fn main() {
    let options = BootstrapOptions {
        secret_keys: vec![],
        endpoints: vec![EndpointAnnounce {
            path: "/greet".to_owned(),
            methods: vec!["GET".to_owned()],
            auth: None,
        }],
        ..BootstrapOptions::default()
    };

    let (state, join) = match bootstrap_module(options, |init, _secrets| Greeter {
        greeting: format!("hello from {}", init.module_id),
    })
    .await
    {
        Ok(ready) => ready,
        Err(e) => {
            eprintln!("bootstrap failed: {e}");
            std::process::exit(e.exit_code());
        }
    };

    // Answer pings from any peer module.
    state.set_default_handler(|source, _request_id, _payload| async move {
        Ok(serde_json::json!({ "pong": true, "from": source }))
    });

    // Serve the HTTP tunnel.
    if let Some(requests) = state.take_http_requests() {
        let greeting = state.user_state().greeting.clone();
        let _service = spawn_http_service(
            requests,
            move |request| {
                let greeting = greeting.clone();
                async move {
                    IpcHttpResponse {
                        request_id: request.request_id,
                        status_code: 200,
                        headers: HashMap::from([(
                            "content-type".to_owned(),
                            "text/plain".to_owned(),
                        )]),
                        body: Some(greeting.into_bytes()),
                    }
                }
            },
            state.cancellation_token(),
        );
    }

    let _ = join.await;
}
