use crate::cli::{self, SessionArgs};
use crate::exit_codes;
use crate::output;
use facelink::config::WebSocketConfig;
use facelink::transport::WebSocketTransport;

pub async fn execute(args: SessionArgs) -> i32 {
    let timeout = match cli::parse_seconds(args.timeout) {
        Ok(timeout) => timeout,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let config = WebSocketConfig {
        endpoint: args.ws.clone(),
        ..Default::default()
    };
    let transport = WebSocketTransport::connect(&config);
    let result = transport.wait_ready(timeout).await;
    transport.shutdown().await;

    match result {
        Ok(session) => match output::emit(&session, args.compact, None) {
            Ok(()) => exit_codes::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_codes::EXECUTION_ERROR
            }
        },
        Err(e) => {
            eprintln!("Error: no session with {}: {}", args.ws, e);
            exit_codes::CONNECTION_ERROR
        }
    }
}
