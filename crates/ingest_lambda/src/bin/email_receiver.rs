use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use chrono::{SecondsFormat, Utc};
use ingest_lambda::adapters::object_reader::{ObjectHead, ObjectReader};
use ingest_lambda::adapters::ProcessError;
use ingest_lambda::config::{init_logging, ReceiverConfig};
use ingest_lambda::handlers::receiver::{handle_notification, ReceiptProcessor, ReceiverResponse};
use lambda_runtime::{service_fn, Error, LambdaEvent};

struct S3ObjectReader {
    s3_client: aws_sdk_s3::Client,
}

fn classify_head_error(error: &SdkError<HeadObjectError>) -> ProcessError {
    let status = error.raw_response().map(|response| response.status().as_u16());
    let message = format!("head_object failed: {error}");
    match status {
        Some(401) | Some(403) => ProcessError::PermissionDenied(message),
        Some(404) => ProcessError::NotFound(message),
        _ if error
            .as_service_error()
            .is_some_and(HeadObjectError::is_not_found) =>
        {
            ProcessError::NotFound(message)
        }
        _ => ProcessError::Transient(message),
    }
}

impl ObjectReader for S3ObjectReader {
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectHead, ProcessError> {
        let client = self.s3_client.clone();
        let bucket = bucket.to_string();
        let object_key = key.to_string();
        let version_id = version_id.map(str::to_string);

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .head_object()
                    .bucket(bucket)
                    .key(object_key)
                    .set_version_id(version_id)
                    .send()
                    .await
                    .map(|output| ObjectHead {
                        size: output.content_length().unwrap_or_default().max(0) as u64,
                        etag: output.e_tag().map(str::to_string),
                        version_id: output.version_id().map(str::to_string),
                        content_type: output.content_type().map(str::to_string),
                    })
                    .map_err(|error| classify_head_error(&error))
            })
        })
    }
}

async fn handle_request(
    event: LambdaEvent<serde_json::Value>,
    config: &ReceiverConfig,
    s3_client: &aws_sdk_s3::Client,
) -> Result<ReceiverResponse, Error> {
    let processor = ReceiptProcessor::new(
        S3ObjectReader {
            s3_client: s3_client.clone(),
        },
        config.bucket.clone(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );

    handle_notification(&event.payload, &processor).map_err(|error| Error::from(error.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = ReceiverConfig::from_env().map_err(Error::from)?;
    init_logging(&config.log_level);

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let s3_client = aws_sdk_s3::Client::new(&aws_config);

    let config = &config;
    let s3_client = &s3_client;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<serde_json::Value>| async move {
        handle_request(event, config, s3_client).await
    }))
    .await
}
