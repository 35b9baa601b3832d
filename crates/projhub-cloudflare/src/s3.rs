//! S3-compatible access to R2 buckets.

use std::time::Duration;

use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::Client as S3Client;
use projhub_core::ProjectError;
use tracing::{debug, warn};

/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;

/// Create an S3 client for an R2 endpoint.
pub fn r2_client(endpoint: &str, access_key: &str, secret_key: &str) -> S3Client {
    let credentials = Credentials::new(access_key, secret_key, None, None, "r2");

    let s3_config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(Region::new("auto"))
        .endpoint_url(endpoint)
        .force_path_style(true)
        .build();

    S3Client::from_conf(s3_config)
}

async fn backoff_sleep(attempt: u32) {
    tokio::time::sleep(Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt))).await;
}

/// Check if an S3 error is retryable (429 or 5xx).
fn is_retryable_s3_error(err: &aws_sdk_s3::error::SdkError<impl std::fmt::Debug>) -> bool {
    use aws_sdk_s3::error::SdkError;
    match err {
        SdkError::ServiceError(e) => {
            let status = e.raw().status().as_u16();
            status == 429 || (500..=504).contains(&status)
        }
        SdkError::ResponseError(e) => {
            let status = e.raw().status().as_u16();
            status == 429 || (500..=504).contains(&status)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        _ => false,
    }
}

/// List one page of object keys.
async fn list_page(
    client: &S3Client,
    bucket: &str,
    continuation_token: Option<String>,
) -> Result<(Vec<String>, Option<String>), ProjectError> {
    for attempt in 0..=MAX_RETRIES {
        let result = client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation_token.clone())
            .send()
            .await;

        match result {
            Ok(output) => {
                let keys = output
                    .contents
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|obj| obj.key)
                    .collect();
                let next = if output.is_truncated.unwrap_or(false) {
                    output.next_continuation_token
                } else {
                    None
                };
                return Ok((keys, next));
            }
            Err(e) => {
                if is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                    warn!(attempt, bucket, "R2 list_objects retryable error, retrying");
                    backoff_sleep(attempt).await;
                    continue;
                }
                return Err(ProjectError::Provider(format!(
                    "R2 list_objects on {} error: {}",
                    bucket, e
                )));
            }
        }
    }
    unreachable!()
}

async fn delete_object(client: &S3Client, bucket: &str, key: &str) -> Result<(), ProjectError> {
    for attempt in 0..=MAX_RETRIES {
        let result = client.delete_object().bucket(bucket).key(key).send().await;

        match result {
            Ok(_) => return Ok(()),
            Err(e) => {
                if is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                    warn!(attempt, key, "R2 delete_object retryable error, retrying");
                    backoff_sleep(attempt).await;
                    continue;
                }
                return Err(ProjectError::Provider(format!(
                    "R2 delete_object {}/{} error: {}",
                    bucket, key, e
                )));
            }
        }
    }
    unreachable!()
}

/// Delete every object of `bucket`. Returns the number of deleted objects.
pub async fn empty_bucket(client: &S3Client, bucket: &str) -> Result<usize, ProjectError> {
    let mut deleted = 0;
    let mut continuation_token = None;

    loop {
        let (keys, next) = list_page(client, bucket, continuation_token).await?;
        for key in &keys {
            delete_object(client, bucket, key).await?;
        }
        deleted += keys.len();

        match next {
            Some(token) => continuation_token = Some(token),
            None => break,
        }
    }

    debug!("Emptied bucket {} ({} objects)", bucket, deleted);
    Ok(deleted)
}
