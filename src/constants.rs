pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";
pub const PROTOCOL_EXPIRE_KEY: &str = "X-Expire";

pub const PEER_BASE_PATH: &str = "/_groupcache";

pub const DEFAULT_GROUP: &str = "responses";
