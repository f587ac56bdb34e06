use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::MakerError;
use crate::types::Side;

/// Capability set the session needs from a wallet. Injected at session
/// construction; the trading loop never branches on the mode.
#[async_trait]
pub trait WalletBroker: Send + Sync {
    /// Available collateral in USDC.
    async fn balance_usdc(&self) -> Result<f64, MakerError>;

    /// Cancel every open order for this wallet. Best-effort: failing with
    /// nothing open is normal.
    async fn cancel_all(&self) -> Result<(), MakerError>;

    /// Post one limit order. Returns the server-assigned order id, or None
    /// when the order is rejected (locally or by the venue).
    async fn place_limit(
        &self,
        token_id: &str,
        price: f64,
        size_shares: f64,
        side: Side,
    ) -> Result<Option<String>, MakerError>;
}

/// The venue accepts two-decimal prices strictly inside (0, 1) and
/// positive share counts. Returns the rounded price for a valid order.
pub(crate) fn validate_order(price: f64, size_shares: f64) -> Option<f64> {
    let rounded = (price * 100.0).round() / 100.0;
    if !(rounded > 0.0 && rounded < 1.0) || !(size_shares > 0.0) {
        return None;
    }
    Some(rounded)
}

// ─── Live broker ───────────────────────────────────────────────────────────

use polymarket_client_sdk::auth::state::Authenticated;
use polymarket_client_sdk::auth::{LocalSigner, Normal, Signer};
use polymarket_client_sdk::clob::types::request::BalanceAllowanceRequest;
use polymarket_client_sdk::clob::types::{AssetType, OrderType as ClobOrderType, Side as ClobSide};
use polymarket_client_sdk::clob::{Client as ClobClient, Config as ClobConfig};
use polymarket_client_sdk::types::{Decimal, U256};
use polymarket_client_sdk::POLYGON;

/// Authenticated CLOB wallet. Derives or creates the L2 API credentials
/// during `connect`; order placement signs with the session key.
pub struct LiveWallet {
    client: ClobClient<Authenticated<Normal>>,
    signer: LocalSigner<k256::ecdsa::SigningKey>,
}

impl LiveWallet {
    pub async fn connect(host: &str, private_key: &str) -> Result<Self, MakerError> {
        let signer = LocalSigner::from_str(private_key)
            .map_err(|e| MakerError::AuthFailure(format!("private key: {e}")))?
            .with_chain_id(Some(POLYGON));

        let client = ClobClient::new(host, ClobConfig::default())
            .map_err(|e| MakerError::AuthFailure(format!("client: {e}")))?
            .authentication_builder(&signer)
            .authenticate()
            .await
            .map_err(|e| MakerError::AuthFailure(format!("authenticate: {e}")))?;

        info!(address = %client.address(), "CLOB wallet authenticated");
        Ok(Self { client, signer })
    }
}

#[async_trait]
impl WalletBroker for LiveWallet {
    async fn balance_usdc(&self) -> Result<f64, MakerError> {
        let params = BalanceAllowanceRequest::builder()
            .asset_type(AssetType::Collateral)
            .build();
        let resp = self
            .client
            .balance_allowance(params)
            .await
            .map_err(|e| MakerError::Transport(format!("balance: {e}")))?;
        // Collateral is reported in 6-decimal base units.
        let raw: f64 = resp.balance.to_string().parse().unwrap_or(0.0);
        Ok(raw / 1_000_000.0)
    }

    async fn cancel_all(&self) -> Result<(), MakerError> {
        self.client
            .cancel_all_orders()
            .await
            .map_err(|e| MakerError::Transport(format!("cancel_all: {e}")))?;
        Ok(())
    }

    async fn place_limit(
        &self,
        token_id: &str,
        price: f64,
        size_shares: f64,
        side: Side,
    ) -> Result<Option<String>, MakerError> {
        let price = match validate_order(price, size_shares) {
            Some(p) => p,
            None => return Ok(None),
        };

        let price_dec = Decimal::from_str(&format!("{price:.2}"))
            .map_err(|e| MakerError::Numeric(format!("price: {e}")))?;
        let size_dec = Decimal::from_str(&format!("{size_shares:.2}"))
            .map_err(|e| MakerError::Numeric(format!("size: {e}")))?;
        let token = U256::from_str(token_id)
            .map_err(|e| MakerError::OrderRejected(format!("token id: {e}")))?;
        let clob_side = match side {
            Side::Buy => ClobSide::Buy,
            Side::Sell => ClobSide::Sell,
        };

        let signable = self
            .client
            .limit_order()
            .token_id(token)
            .price(price_dec)
            .size(size_dec)
            .side(clob_side)
            .order_type(ClobOrderType::GTC)
            .build()
            .await
            .map_err(|e| MakerError::Transport(format!("build: {e}")))?;
        let signed = self
            .client
            .sign(&self.signer, signable)
            .await
            .map_err(|e| MakerError::Transport(format!("sign: {e}")))?;
        let resp = self
            .client
            .post_order(signed)
            .await
            .map_err(|e| MakerError::Transport(format!("post: {e}")))?;

        if resp.success {
            Ok(Some(resp.order_id))
        } else {
            let msg = resp.error_msg.unwrap_or_else(|| "unknown error".into());
            warn!(%side, price, size_shares, error = %msg, "order rejected by venue");
            Ok(None)
        }
    }
}

// ─── Simulated broker ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimOrder {
    pub token_id: String,
    pub price: f64,
    pub size_shares: f64,
    pub side: Side,
}

#[derive(Default)]
struct SimInner {
    balance: f64,
    cancel_calls: AtomicU32,
    next_id: AtomicU64,
    orders: Mutex<Vec<SimOrder>>,
}

/// Simulation shim: every valid order succeeds synthetically; fills are
/// attributed by the session against the live book. Cheap to clone so
/// tests can keep a handle on the counters.
#[derive(Clone, Default)]
pub struct SimWallet {
    inner: Arc<SimInner>,
}

impl SimWallet {
    pub fn with_balance(balance: f64) -> Self {
        Self {
            inner: Arc::new(SimInner {
                balance,
                ..Default::default()
            }),
        }
    }

    pub fn cancel_count(&self) -> u32 {
        self.inner.cancel_calls.load(Ordering::Relaxed)
    }

    pub fn orders(&self) -> Vec<SimOrder> {
        self.inner.orders.lock().clone()
    }
}

#[async_trait]
impl WalletBroker for SimWallet {
    async fn balance_usdc(&self) -> Result<f64, MakerError> {
        Ok(self.inner.balance)
    }

    async fn cancel_all(&self) -> Result<(), MakerError> {
        self.inner.cancel_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn place_limit(
        &self,
        token_id: &str,
        price: f64,
        size_shares: f64,
        side: Side,
    ) -> Result<Option<String>, MakerError> {
        let price = match validate_order(price, size_shares) {
            Some(p) => p,
            None => return Ok(None),
        };
        self.inner.orders.lock().push(SimOrder {
            token_id: token_id.to_string(),
            price,
            size_shares,
            side,
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Some(format!("sim-{id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: prices at, inside, and outside the venue's (0, 1) bounds,
    /// plus non-positive sizes.
    /// Expected: rounding to two decimals first, then rejection of anything
    /// that lands on or outside the bounds.
    #[test]
    fn order_validation_bounds() {
        assert_eq!(validate_order(0.4951, 10.0), Some(0.50));
        assert_eq!(validate_order(0.494, 10.0), Some(0.49));
        assert_eq!(validate_order(0.999, 10.0), None); // rounds to 1.00
        assert_eq!(validate_order(0.001, 10.0), None); // rounds to 0.00
        assert_eq!(validate_order(1.2, 10.0), None);
        assert_eq!(validate_order(-0.1, 10.0), None);
        assert_eq!(validate_order(0.50, 0.0), None);
        assert_eq!(validate_order(0.50, -3.0), None);
        assert_eq!(validate_order(f64::NAN, 10.0), None);
    }

    /// Scenario: a sim wallet receiving valid and invalid orders plus
    /// cancels.
    /// Expected: valid orders are recorded with rounded prices and fresh
    /// ids; invalid ones return None; cancel calls are counted.
    #[tokio::test]
    async fn sim_wallet_records_orders() {
        let wallet = SimWallet::with_balance(25.0);
        assert_eq!(wallet.balance_usdc().await.unwrap(), 25.0);

        let id = wallet
            .place_limit("tok", 0.487, 2.0, Side::Buy)
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("sim-0"));
        let none = wallet
            .place_limit("tok", 1.5, 2.0, Side::Sell)
            .await
            .unwrap();
        assert!(none.is_none());

        wallet.cancel_all().await.unwrap();
        wallet.cancel_all().await.unwrap();
        assert_eq!(wallet.cancel_count(), 2);

        let orders = wallet.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, 0.49);
        assert_eq!(orders[0].side, Side::Buy);
    }
}
