use crate::api::MarketGateway;
use crate::models::OrderFill;

/// Fee estimate for previews: 0.1% of notional
pub const ESTIMATED_FEE_RATE: f64 = 0.001;

/// Total commission of an order, in the quote currency
///
/// Commissions charged in another asset (BNB rebates, base asset) are
/// converted at the current `{asset}{quote}` price. A commission that
/// cannot be priced is skipped with a warning rather than failing a filled
/// order.
pub async fn order_fee_in_quote(gateway: &dyn MarketGateway, order: &OrderFill, quote: &str) -> f64 {
    let mut total = 0.0;

    for fill in &order.fills {
        if fill.commission == 0.0 {
            continue;
        }

        if fill.commission_asset == quote {
            total += fill.commission;
            continue;
        }

        let pair = format!("{}{}", fill.commission_asset, quote);
        match gateway.price(&pair).await {
            Ok(price) => total += fill.commission * price.price,
            Err(e) => tracing::warn!(
                "Cannot price {} {} commission on {}: {}",
                fill.commission,
                fill.commission_asset,
                order.symbol,
                e
            ),
        }
    }

    total
}
