use loadgend::request::{AuthDescriptor, Method, RequestSpec};

pub fn get_spec(url: String, timeout_ms: u64) -> RequestSpec {
    RequestSpec {
        method: Method::Get,
        url,
        headers: vec![],
        body: None,
        body_mime: None,
        auth: AuthDescriptor::None,
        timeout_ms,
    }
}
