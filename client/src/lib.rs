use std::path::PathBuf;

use comfy_table::{presets::UTF8_HORIZONTAL_ONLY, Attribute, Cell, ContentArrangement, Table};
use kernel::{ErrorBody, StoredAsset, UploadReceipt};
use reqwest::{Client, Response};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use url::{ParseError, Url};

pub struct UploadParams {
    pub uri: String,
    pub file: String,
    pub owner: i64,
    pub container: i64,
}

/// `{base}/api/assets/{owner}/{container}/{file_name}` with the file name escaped.
pub fn upload_uri(base: &str, owner: i64, container: i64, file_name: &str) -> Result<Url, ParseError> {
    api_uri(
        base,
        &["assets", &owner.to_string(), &container.to_string(), file_name],
    )
}

pub fn container_uri(base: &str, container: i64) -> Result<Url, ParseError> {
    api_uri(base, &["containers", &container.to_string()])
}

fn api_uri(base: &str, segments: &[&str]) -> Result<Url, ParseError> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|()| ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .push("api")
        .extend(segments);
    Ok(url)
}

pub async fn upload_file(params: UploadParams) {
    let path = PathBuf::from(&params.file);
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        println!("invalid file path {}", params.file);
        return;
    };
    let uri = match upload_uri(&params.uri, params.owner, params.container, file_name) {
        Ok(u) => u,
        Err(e) => {
            println!("invalid uri {}: {e}", params.uri);
            return;
        }
    };

    let f = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            println!("no such file {}: {e}", params.file);
            return;
        }
    };
    let stream = reqwest::Body::wrap_stream(ReaderStream::new(f));

    let client = Client::new();
    match client.post(uri).body(stream).send().await {
        Ok(response) if response.status().is_success() => {
            let status = response.status();
            match response.json::<UploadReceipt>().await {
                Ok(receipt) => {
                    println!("file {} uploaded. Status: {status}", params.file);
                    println!("{}", receipt_table(&receipt));
                }
                Err(e) => println!("JSON decode error: {e}"),
            }
        }
        Ok(response) => print_failure(response).await,
        Err(e) => println!("upload error: {e}"),
    }
}

pub async fn list_container(uri: &str, container: i64) {
    let uri = match container_uri(uri, container) {
        Ok(u) => u,
        Err(e) => {
            println!("invalid uri {uri}: {e}");
            return;
        }
    };

    let client = Client::new();
    match client.get(uri).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<Vec<StoredAsset>>().await {
                Ok(assets) => println!("{}", assets_table(&assets)),
                Err(e) => println!("JSON decode error: {e}"),
            }
        }
        Ok(response) => print_failure(response).await,
        Err(e) => {
            println!("error: {e}");
        }
    }
}

async fn print_failure(response: Response) {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => println!(
            "{} ({status}, {}): {}",
            body.user_message, body.error_code, body.error_details
        ),
        Err(_) => println!("request failed. Status: {status}"),
    }
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_HORIZONTAL_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120)
        .set_header(
            header
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
        );
    table
}

#[must_use]
pub fn receipt_table(receipt: &UploadReceipt) -> Table {
    let mut table = new_table(&["Asset", "Key", "Size", "Disk", "Location"]);
    for (disk, location) in &receipt.storage_locations {
        table.add_row(vec![
            Cell::new(receipt.asset_id),
            Cell::new(&receipt.content_key),
            Cell::new(receipt.byte_size),
            Cell::new(disk),
            Cell::new(location),
        ]);
    }
    table
}

#[must_use]
pub fn assets_table(assets: &[StoredAsset]) -> Table {
    let mut table = new_table(&["Asset", "Owner", "Type", "Size", "Disks"]);
    for a in assets {
        let disks = a
            .storage_locations
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(a.id),
            Cell::new(a.owner_id),
            Cell::new(&a.mime_type),
            Cell::new(a.byte_size),
            Cell::new(disks),
        ]);
    }
    table
}
