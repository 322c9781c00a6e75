pub const BLOB_DIR_NAME: &str = "blobs";
pub const TMP_DIR_NAME: &str = "tmp";

pub const FILE_KEY_PREFIX: &str = "file";
pub const CHECKSUM_KEY_PREFIX: &str = "sum";
pub const NODE_KEY_PREFIX: &str = "node";
pub const TASK_KEY_PREFIX: &str = "task";
pub const REPLOG_KEY_PREFIX: &str = "replog";
pub const UPLOAD_KEY_PREFIX: &str = "upload";
pub const PART_KEY_PREFIX: &str = "part";

pub const MAX_OBJECT_KEY_LEN: usize = 256;

/// Request headers understood by the coordinator upload route.
pub const HEADER_FILE_NAME: &str = "x-file-name";
pub const HEADER_DOWNLOAD_LIMIT: &str = "x-download-limit";
pub const HEADER_TTL_SECONDS: &str = "x-ttl-seconds";
pub const HEADER_SERVED_BY: &str = "x-served-by";
pub const HEADER_CHECKSUM: &str = "x-checksum";
