// =============================================================================
// Live Broker Client — OTP login, bearer-token lifecycle, JSON order API
// =============================================================================
//
// SECURITY: the TOTP secret and PIN are never logged or serialized. The
// access token is short-lived; every call goes through `ensure_token`, which
// re-authenticates when the token is within a minute of expiry.
//
// Order placement carries a hard 10 s deadline; status and cancel share the
// client-wide timeout. HTTP-level failures map onto `BrokerError::Transport`
// so the caller's retry schedule applies.
// =============================================================================

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::{Broker, BrokerError, Instrument, Order, OrderState, OrderStatusReport};

type HmacSha256 = Hmac<Sha256>;

/// TOTP step (seconds) and digit count.
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Refresh the token when it has less than this long to live.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Deadline on order placement.
const PLACE_ORDER_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// TOTP
// ---------------------------------------------------------------------------

/// RFC 6238 one-time passcode over HMAC-SHA256. The shared secret is supplied
/// hex-encoded.
pub fn totp_code(secret_hex: &str, unix_secs: u64) -> Result<String, BrokerError> {
    let secret = hex::decode(secret_hex)
        .map_err(|_| BrokerError::Auth("TOTP secret is not valid hex".into()))?;
    if secret.is_empty() {
        return Err(BrokerError::Auth("TOTP secret is empty".into()));
    }

    let counter = unix_secs / TOTP_STEP_SECS;
    let mut mac = HmacSha256::new_from_slice(&secret).expect("HMAC accepts any key size");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3).
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    Ok(format!(
        "{:0width$}",
        code % 10u32.pow(TOTP_DIGITS),
        width = TOTP_DIGITS as usize
    ))
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    expires_in_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderResponse {
    order_id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    filled_qty: i64,
    #[serde(default)]
    avg_price: f64,
}

fn parse_state(s: &str) -> OrderState {
    match s.to_uppercase().as_str() {
        "FILLED" | "FULLY EXECUTED" => OrderState::Filled,
        "PARTIALLY_FILLED" | "PARTIALLY EXECUTED" => OrderState::PartiallyFilled,
        "CANCELLED" => OrderState::Cancelled,
        "REJECTED" => OrderState::Rejected,
        _ => OrderState::Pending,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct TokenState {
    token: String,
    expires_at: Instant,
}

pub struct PaisaClient {
    client_code: String,
    pin: String,
    totp_secret_hex: String,
    base_url: String,
    http: reqwest::Client,
    token: Mutex<Option<TokenState>>,
}

impl PaisaClient {
    pub fn new(
        client_code: impl Into<String>,
        pin: impl Into<String>,
        totp_secret_hex: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build broker http client");

        Self {
            client_code: client_code.into(),
            pin: pin.into(),
            totp_secret_hex: totp_secret_hex.into(),
            base_url: base_url.into(),
            http,
            token: Mutex::new(None),
        }
    }

    /// A valid bearer token, re-authenticating when the cached one is close
    /// to expiry.
    async fn ensure_token(&self) -> Result<String, BrokerError> {
        {
            let guard = self.token.lock();
            if let Some(state) = guard.as_ref() {
                if state.expires_at.saturating_duration_since(Instant::now())
                    > TOKEN_REFRESH_MARGIN
                {
                    return Ok(state.token.clone());
                }
            }
        }
        self.login().await
    }

    #[instrument(skip(self), name = "broker::login")]
    async fn login(&self) -> Result<String, BrokerError> {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs();
        let totp = totp_code(&self.totp_secret_hex, unix_secs)?;

        let body = serde_json::json!({
            "clientCode": self.client_code,
            "pin": self.pin,
            "totp": totp,
        });

        let resp = self
            .http
            .post(format!("{}/auth/totp-login", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "login"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BrokerError::Auth(format!("login returned {status}")));
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Auth(format!("unparseable login response: {e}")))?;

        let token = login.access_token.clone();
        *self.token.lock() = Some(TokenState {
            token: login.access_token,
            expires_at: Instant::now() + Duration::from_secs(login.expires_in_secs),
        });

        info!(expires_in_secs = login.expires_in_secs, "broker session established");
        Ok(token)
    }
}

fn map_reqwest_error(e: reqwest::Error, what: &str) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout(format!("{what} timed out"))
    } else {
        BrokerError::Transport(format!("{what} failed: {e}"))
    }
}

#[async_trait]
impl Broker for PaisaClient {
    #[instrument(skip(self, order), name = "broker::place_order", fields(scrip = %instrument.scrip_code))]
    async fn place_order(
        &self,
        instrument: &Instrument,
        order: &Order,
    ) -> Result<String, BrokerError> {
        let token = self.ensure_token().await?;

        let mut body = serde_json::json!({
            "scripCode": instrument.scrip_code,
            "exchange": instrument.exchange.to_string(),
            "exchangeType": instrument.segment.to_string(),
            "side": order.side().to_string(),
            "qty": order.quantity(),
            "orderType": match order {
                Order::Market { .. } => "MARKET",
                Order::Limit { .. } => "LIMIT",
                Order::StopLimit { .. } => "STOP_LIMIT",
            },
        });
        if let Some(limit) = order.limit_price() {
            body["limitPrice"] = serde_json::json!(limit);
        }
        if let Order::StopLimit { trigger_price, .. } = order {
            body["triggerPrice"] = serde_json::json!(trigger_price);
        }

        debug!(side = %order.side(), qty = order.quantity(), "placing live order");

        let resp = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&token)
            .timeout(PLACE_ORDER_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "place_order"))?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(BrokerError::Auth("token rejected".into()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!(
                "place_order returned {status}: {text}"
            )));
        }

        let placed: PlaceOrderResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("unparseable order response: {e}")))?;

        if let Some(s) = &placed.status {
            if parse_state(s) == OrderState::Rejected {
                return Err(BrokerError::Rejected(format!(
                    "order {} rejected at placement",
                    placed.order_id
                )));
            }
        }

        Ok(placed.order_id)
    }

    #[instrument(skip(self), name = "broker::modify_order")]
    async fn modify_order(&self, order_id: &str, new_limit_price: f64) -> Result<(), BrokerError> {
        let token = self.ensure_token().await?;

        let resp = self
            .http
            .put(format!("{}/orders/{}", self.base_url, order_id))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "limitPrice": new_limit_price }))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "modify_order"))?;

        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "modify returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let token = self.ensure_token().await?;

        let resp = self
            .http
            .delete(format!("{}/orders/{}", self.base_url, order_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "cancel_order"))?;

        if !resp.status().is_success() {
            warn!(order_id, status = %resp.status(), "cancel refused");
            return Err(BrokerError::Rejected(format!(
                "cancel returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "broker::order_status")]
    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, BrokerError> {
        let token = self.ensure_token().await?;

        let resp = self
            .http
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, "order_status"))?;

        if resp.status().as_u16() == 404 {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(BrokerError::Transport(format!(
                "status returned {}",
                resp.status()
            )));
        }

        let status: StatusResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("unparseable status response: {e}")))?;

        Ok(OrderStatusReport {
            order_id: order_id.to_string(),
            state: parse_state(&status.status),
            filled_qty: status.filled_qty,
            avg_price: status.avg_price,
        })
    }
}

impl std::fmt::Debug for PaisaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaisaClient")
            .field("client_code", &self.client_code)
            .field("pin", &"<redacted>")
            .field("totp_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 Appendix B test vectors for HMAC-SHA256 (secret
    // "12345678901234567890123456789012", 8 digits truncated to 6 here by
    // taking the code mod 10^6).
    const RFC_SECRET_HEX: &str =
        "3132333435363738393031323334353637383930313233343536373839303132";

    #[test]
    fn totp_matches_rfc6238_vectors() {
        // T=59 => 8-digit 46119246 => 6-digit 119246.
        assert_eq!(totp_code(RFC_SECRET_HEX, 59).unwrap(), "119246");
        // T=1111111109 => 68084774 => 084774.
        assert_eq!(totp_code(RFC_SECRET_HEX, 1_111_111_109).unwrap(), "084774");
    }

    #[test]
    fn totp_is_stable_within_a_step() {
        let a = totp_code(RFC_SECRET_HEX, 60).unwrap();
        let b = totp_code(RFC_SECRET_HEX, 89).unwrap();
        let c = totp_code(RFC_SECRET_HEX, 90).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn totp_rejects_bad_secret() {
        assert!(matches!(
            totp_code("not-hex", 0).unwrap_err(),
            BrokerError::Auth(_)
        ));
        assert!(matches!(totp_code("", 0).unwrap_err(), BrokerError::Auth(_)));
    }

    #[test]
    fn order_state_parsing() {
        assert_eq!(parse_state("Fully Executed"), OrderState::Filled);
        assert_eq!(parse_state("PARTIALLY_FILLED"), OrderState::PartiallyFilled);
        assert_eq!(parse_state("rejected"), OrderState::Rejected);
        assert_eq!(parse_state("working"), OrderState::Pending);
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = PaisaClient::new("C123", "9876", RFC_SECRET_HEX, "http://localhost:9");
        let rendered = format!("{client:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("9876"));
        assert!(!rendered.contains(RFC_SECRET_HEX));
    }
}
