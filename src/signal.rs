use crate::feed::MarketFrame;

const STD_EPS: f64 = 1e-9;

/// Canonical key for a ticker pair; `(A, B)` and `(B, A)` map to the same
/// trade slot.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

/// Rolling z-score of the spread `t1 - t2` at the latest aligned timestamp.
/// Returns `None` when fewer than `window` aligned points exist or the
/// trailing standard deviation vanishes; never divides by zero.
pub fn zscore(frame: &MarketFrame, t1: &str, t2: &str, window: usize) -> Option<f64> {
    if window < 2 {
        return None;
    }
    let (col1, col2) = (frame.column(t1)?, frame.column(t2)?);

    let mut spread: Vec<f64> = Vec::with_capacity(frame.len());
    for (a, b) in col1.iter().zip(col2.iter()) {
        if let (Some(a), Some(b)) = (a, b) {
            spread.push(a - b);
        }
    }
    if spread.len() < window {
        return None;
    }

    let tail = &spread[spread.len() - window..];
    let (mean, std) = mean_std(tail)?;
    if std < STD_EPS {
        return None;
    }
    let latest = *tail.last()?;
    Some((latest - mean) / std)
}

fn mean_std(window: &[f64]) -> Option<(f64, f64)> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().copied().sum::<f64>() / window.len() as f64;
    let var = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / window.len() as f64;
    Some((mean, var.sqrt()))
}
