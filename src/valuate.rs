use crate::models::{Confidence, ItemRecord, PriceQuote, ValuationResult};
use tracing::debug;

/// Quote spread (coefficient of variation) below which a well-populated
/// sample counts as high confidence.
const HIGH_CONFIDENCE_CV: f64 = 0.25;

/// Turns an item's quotes into a valuation.
pub struct Valuator {
    min_match_confidence: f32,
}

impl Valuator {
    pub fn new(min_match_confidence: f32) -> Self {
        Self {
            min_match_confidence,
        }
    }

    /// Median of the quotes clearing the confidence threshold. Acquisition
    /// cost comes from the current bid when the listing exposed one; without
    /// it the margin stays unknown rather than defaulting to zero.
    pub fn valuate(&self, item: &ItemRecord, quotes: Vec<PriceQuote>) -> ValuationResult {
        let accepted: Vec<f64> = quotes
            .iter()
            .filter(|quote| quote.match_confidence >= self.min_match_confidence)
            .map(|quote| quote.price)
            .collect();

        let estimated_value = median(&accepted);
        let acquisition_cost = item.current_bid;
        let profit_margin = match (estimated_value, acquisition_cost) {
            (Some(value), Some(cost)) => Some(value - cost),
            _ => None,
        };
        let confidence = confidence_for(&accepted);

        debug!(
            target = "lotscout.valuate",
            item_id = %item.id,
            quotes = quotes.len(),
            accepted = accepted.len(),
            estimated = ?estimated_value,
            "valuation computed"
        );

        ValuationResult {
            item_id: item.id.clone(),
            estimated_value,
            acquisition_cost,
            profit_margin,
            confidence,
            price_quotes: quotes,
        }
    }
}

/// Median; an even-sized sample takes the mean of the two central values.
fn median(prices: &[f64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

fn confidence_for(accepted: &[f64]) -> Confidence {
    if accepted.len() <= 1 {
        return Confidence::Low;
    }
    if accepted.len() >= 3 {
        let mean = accepted.iter().sum::<f64>() / accepted.len() as f64;
        if mean > 0.0 {
            let variance = accepted
                .iter()
                .map(|price| (price - mean).powi(2))
                .sum::<f64>()
                / accepted.len() as f64;
            if variance.sqrt() / mean < HIGH_CONFIDENCE_CV {
                return Confidence::High;
            }
        }
    }
    Confidence::Medium
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(current_bid: Option<f64>) -> ItemRecord {
        ItemRecord {
            id: "cam-7".into(),
            title: "Vintage Camera".into(),
            description: "Vintage camera, shutter fires".into(),
            condition: None,
            current_bid,
            time_remaining: None,
            source_url: "https://auction.example/lots/cam-7".into(),
            image_refs: Vec::new(),
            raw_fields: BTreeMap::new(),
        }
    }

    fn quote(source: &str, price: f64, confidence: f32) -> PriceQuote {
        PriceQuote {
            source_name: source.into(),
            price,
            currency: "USD".into(),
            match_confidence: confidence,
            query_used: "vintage camera".into(),
        }
    }

    #[test]
    fn vintage_camera_scenario() {
        // Cost 40; web search returns 120, 115 and a low-confidence 400;
        // marketplace returns 125. The 400 is rejected, median of
        // [115, 120, 125] is 120, margin 80.
        let quotes = vec![
            quote("web_search", 120.0, 0.8),
            quote("web_search", 115.0, 0.6),
            quote("web_search", 400.0, 0.2),
            quote("marketplace", 125.0, 0.7),
        ];
        let result = Valuator::new(0.5).valuate(&item(Some(40.0)), quotes);
        assert_eq!(result.estimated_value, Some(120.0));
        assert_eq!(result.acquisition_cost, Some(40.0));
        assert_eq!(result.profit_margin, Some(80.0));
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.price_quotes.len(), 4);
    }

    #[test]
    fn even_count_takes_mean_of_middle_pair() {
        let quotes = vec![
            quote("web_search", 100.0, 0.8),
            quote("web_search", 110.0, 0.8),
            quote("web_search", 130.0, 0.8),
            quote("web_search", 200.0, 0.8),
        ];
        let result = Valuator::new(0.5).valuate(&item(None), quotes);
        assert_eq!(result.estimated_value, Some(120.0));
    }

    #[test]
    fn no_acquisition_cost_means_no_margin() {
        let quotes = vec![quote("web_search", 80.0, 0.9), quote("web_search", 90.0, 0.9)];
        let result = Valuator::new(0.5).valuate(&item(None), quotes);
        assert_eq!(result.estimated_value, Some(85.0));
        assert!(result.acquisition_cost.is_none());
        assert!(result.profit_margin.is_none());
    }

    #[test]
    fn nothing_clears_threshold_yields_low_confidence_unknown() {
        let quotes = vec![quote("web_search", 50.0, 0.3)];
        let result = Valuator::new(0.5).valuate(&item(Some(10.0)), quotes);
        assert!(result.estimated_value.is_none());
        assert!(result.profit_margin.is_none());
        assert_eq!(result.confidence, Confidence::Low);
        // Rejected quotes are still carried for the report.
        assert_eq!(result.price_quotes.len(), 1);
    }

    #[test]
    fn wide_spread_caps_confidence_at_medium() {
        let quotes = vec![
            quote("web_search", 20.0, 0.8),
            quote("web_search", 100.0, 0.8),
            quote("marketplace", 300.0, 0.7),
        ];
        let result = Valuator::new(0.5).valuate(&item(Some(10.0)), quotes);
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn single_quote_is_low_confidence() {
        let quotes = vec![quote("web_search", 75.0, 0.9)];
        let result = Valuator::new(0.5).valuate(&item(Some(20.0)), quotes);
        assert_eq!(result.estimated_value, Some(75.0));
        assert_eq!(result.confidence, Confidence::Low);
    }
}
