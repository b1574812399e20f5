//! 测试辅助：构造 multipart 请求体与 JWT。

use axum::body::Body as AxumBody;
use axum::extract::{FromRequest, Multipart};
use axum::http::{Request, header};
use jsonwebtoken::{EncodingKey, Header, encode};

use crate::auth::{Claims, Role};

pub const BOUNDARY: &str = "certportal-test-boundary";
pub const TEST_SECRET: &str = "test-secret";

#[derive(Default)]
pub struct MultipartBuilder {
    body: Vec<u8>,
}

impl MultipartBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.body
    }
}

pub async fn multipart_from(builder: MultipartBuilder) -> Multipart {
    let request = Request::builder()
        .method("POST")
        .header(header::CONTENT_TYPE, MultipartBuilder::content_type())
        .body(AxumBody::from(builder.finish()))
        .expect("build request");
    Multipart::from_request(request, &())
        .await
        .unwrap_or_else(|_| panic!("multipart extraction failed"))
}

pub fn token_for(sub: i64, role: Role, secret: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        sub,
        role,
        email: Some(format!("user{sub}@example.edu")),
        exp: (chrono::Utc::now().timestamp() + ttl_secs) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("encode token")
}
