use crate::cli::DetectArgs;
use crate::exit_codes;
use crate::output;
use facelink::config::HttpConfig;
use facelink::transport::HttpRecognitionClient;
use facelink::{CaptureSource, FileCaptureSource};

pub async fn execute(args: DetectArgs) -> i32 {
    let image = match FileCaptureSource::open(&args.image) {
        Ok(source) => match source.capture().await {
            Ok(image) => image,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::INPUT_ERROR;
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let config = HttpConfig {
        detection: args.endpoint.clone(),
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };
    let client = match HttpRecognitionClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let region = match client.try_detect(&image).await {
        Ok(region) => region,
        Err(e) => {
            eprintln!("Error: detection failed: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    if region.is_empty() {
        eprintln!("No face detected");
    }

    match output::emit(&region, args.compact, args.output.as_deref()) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}
