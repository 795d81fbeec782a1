use client::UploadParams;

pub async fn upload_single_file(params: UploadParams) {
    client::upload_file(params).await;
}

pub async fn list_container(uri: &str, container: i64) {
    client::list_container(uri, container).await;
}
