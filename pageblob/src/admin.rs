use crate::backend::{BlobProperties, ObjectStorePageBackend, PageBlobBackend};
use object_store::path::Path;
use object_store::ObjectStore;
use serde_json::json;
use std::env;
use std::error::Error;
use std::sync::Arc;

/// Loads an object store from configured environment variables.
/// The provider is specified using the CLOUD_PROVIDER variable.
/// For specific provider configurations, see the corresponding
/// method documentation:
///
/// | Provider | Value | Documentation |
/// |----------|-------|---------------|
/// | In memory | `memory` | [load_memory] |
/// | Local | `local` | [load_local] |
/// | AWS | `aws` | `load_aws` |
/// | Azure | `azure` | `load_azure` |
pub fn load_object_store_from_env(
    env_file: Option<String>,
) -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    dotenvy::from_filename(env_file.unwrap_or(String::from(".env"))).ok();

    let provider = &*required_var("CLOUD_PROVIDER")?.to_lowercase();

    match provider {
        "memory" => load_memory(),
        "local" => load_local(),
        #[cfg(feature = "aws")]
        "aws" => load_aws(),
        #[cfg(feature = "azure")]
        "azure" => load_azure(),
        _ => Err(format!("Unknown CLOUD_PROVIDER: '{}'", provider).into()),
    }
}

/// Builds a page blob backend rooted at `path` in `object_store`.
pub fn page_blob_backend(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
) -> Arc<dyn PageBlobBackend> {
    Arc::new(ObjectStorePageBackend::new(path, object_store))
}

/// Renders a blob's attributes as a JSON string.
pub fn properties_to_json(key: &str, properties: &BlobProperties) -> String {
    json!({
        "key": key,
        "size_bytes": properties.size_bytes,
        "revision_tag": properties.revision_tag.as_str(),
        "metadata": properties.metadata,
    })
    .to_string()
}

fn required_var(name: &str) -> Result<String, Box<dyn Error>> {
    env::var(name).map_err(|_| format!("{} must be set", name).into())
}

/// Loads an in-memory object store. Its contents live as long as the process.
pub fn load_memory() -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    Ok(Arc::new(object_store::memory::InMemory::new()) as Arc<dyn ObjectStore>)
}

/// Loads a local filesystem object store rooted at LOCAL_PATH.
///
/// The local filesystem store cannot update an object conditionally, so it only supports
/// creating, listing, and reading blobs.
pub fn load_local() -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    let local_path = required_var("LOCAL_PATH")?;
    let lfs = object_store::local::LocalFileSystem::new_with_prefix(local_path)?;
    Ok(Arc::new(lfs) as Arc<dyn ObjectStore>)
}

/// Loads an AWS S3 Object store instance.
///
/// | Env Variable | Doc | Required |
/// |--------------|-----|----------|
/// | AWS_ACCESS_KEY_ID | The access key for a role with permissions to access the store | Yes |
/// | AWS_SECRET_ACCESS_KEY | The access key secret for the above ID | Yes |
/// | AWS_SESSION_TOKEN | The session token for the above ID | No |
/// | AWS_BUCKET | The bucket to use within S3 | Yes |
/// | AWS_REGION | The AWS region to use | Yes |
/// | AWS_ENDPOINT | The endpoint to use for S3 (disables https) | No |
#[cfg(feature = "aws")]
pub fn load_aws() -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    use object_store::aws::S3ConditionalPut;

    let key = required_var("AWS_ACCESS_KEY_ID")?;
    let secret = required_var("AWS_SECRET_ACCESS_KEY")?;
    let session_token = env::var("AWS_SESSION_TOKEN").ok();
    let bucket = required_var("AWS_BUCKET")?;
    let region = required_var("AWS_REGION")?;
    let endpoint = env::var("AWS_ENDPOINT").ok();
    let builder = object_store::aws::AmazonS3Builder::new()
        .with_access_key_id(key)
        .with_secret_access_key(secret)
        .with_bucket_name(bucket)
        .with_region(region)
        .with_conditional_put(S3ConditionalPut::ETagMatch);

    let builder = if let Some(token) = session_token {
        builder.with_token(token)
    } else {
        builder
    };

    let builder = if let Some(endpoint) = endpoint {
        builder.with_allow_http(true).with_endpoint(endpoint)
    } else {
        builder
    };

    Ok(Arc::new(builder.build()?) as Arc<dyn ObjectStore>)
}

/// Loads an Azure Object store instance.
///
/// | Env Variable | Doc | Required |
/// |--------------|-----|----------|
/// | AZURE_ACCOUNT | The azure storage account name | Yes |
/// | AZURE_KEY | The azure storage account key| Yes |
/// | AZURE_CONTAINER | The storage container name| Yes |
#[cfg(feature = "azure")]
pub fn load_azure() -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    let account = required_var("AZURE_ACCOUNT")?;
    let key = required_var("AZURE_KEY")?;
    let container = required_var("AZURE_CONTAINER")?;
    let builder = object_store::azure::MicrosoftAzureBuilder::new()
        .with_account(account)
        .with_access_key(key)
        .with_container_name(container);
    Ok(Arc::new(builder.build()?) as Arc<dyn ObjectStore>)
}
