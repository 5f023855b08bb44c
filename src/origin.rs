//! The fixed upstream host family fronted by the proxy.

pub const MAIN_HOST: &str = "github.com";
pub const RAW_HOST: &str = "raw.githubusercontent.com";
pub const API_HOST: &str = "api.github.com";
pub const GIST_HOST: &str = "gist.github.com";
pub const GIST_RAW_HOST: &str = "gist.githubusercontent.com";
pub const CODELOAD_HOST: &str = "codeload.github.com";
pub const OBJECTS_HOST: &str = "objects.githubusercontent.com";

/// Endpoint used to validate credentials.
pub const API_USER_URL: &str = "https://api.github.com/user";
