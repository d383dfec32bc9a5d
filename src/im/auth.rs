//! 账号登录

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::im::types::handle_http_response;

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// 登录成功后返回的账号信息和网关 token
#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
    pub token: String,
}

/// 用户名密码登录，返回后续连接和 REST 调用共用的 token
pub async fn login_async(api_base_url: &str, username: &str, password: &str) -> Result<LoginData> {
    use uuid::Uuid;

    let client = reqwest::Client::new();
    let url = format!("{}/user/login", api_base_url.trim_end_matches('/'));
    let request_id = Uuid::new_v4().to_string();

    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   用户名: {}", username);
    debug!("   RequestID: {}", request_id);

    let login_req = LoginRequest {
        username: username.to_string(),
        password: password.to_string(),
    };
    let response = client
        .post(&url)
        .header("X-Request-Id", &request_id)
        .json(&login_req)
        .send()
        .await
        .context("登录请求失败")?;

    let api_resp = handle_http_response::<LoginData>(response, "登录").await?;
    let data = api_resp
        .data
        .ok_or_else(|| anyhow::anyhow!("登录响应缺少 data"))?;
    info!("✅ 登录成功: user_id={}, nickname={}", data.user_id, data.nickname);
    Ok(data)
}
