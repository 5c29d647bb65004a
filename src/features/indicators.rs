// Rolling-window technical indicators over equally spaced candles.
//
// Every function returns a series the same length as its input, with NaN
// wherever the indicator is not yet defined (warm-up period, division by
// zero, NaN inputs). Callers drop rows with any undefined value.

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    rolling(values, period, |w| w.iter().sum::<f64>() / w.len() as f64)
}

/// Sample standard deviation (n - 1) over `period` values.
pub fn rolling_std(values: &[f64], period: usize) -> Vec<f64> {
    rolling(values, period, |w| sample_std(w))
}

fn rolling(values: &[f64], period: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    if period == 0 {
        return vec![f64::NAN; values.len()];
    }
    (0..values.len())
        .map(|i| if i + 1 < period { f64::NAN } else { f(&values[i + 1 - period..=i]) })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn population_std(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn ratio(num: f64, den: f64) -> f64 {
    let r = num / den;
    if r.is_finite() {
        r
    } else {
        f64::NAN
    }
}

pub fn log_returns(close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| if i == 0 { f64::NAN } else { close[i].ln() - close[i - 1].ln() })
        .collect()
}

pub fn pct_change(close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| if i == 0 { f64::NAN } else { ratio(close[i], close[i - 1]) - 1.0 })
        .collect()
}

/// Z-score of log returns against their own `period` rolling mean and
/// sample deviation.
pub fn z_score(close: &[f64], period: usize) -> Vec<f64> {
    let returns = log_returns(close);
    let means = sma(&returns, period);
    let stds = rolling_std(&returns, period);
    returns
        .iter()
        .zip(means.iter().zip(&stds))
        .map(|(r, (m, s))| ratio(r - m, *s))
        .collect()
}

pub fn series_z_score(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let m = mean(values);
    let s = sample_std(values);
    values.iter().map(|v| ratio(v - m, s)).collect()
}

/// Wilder's RSI on a 0..=100 scale. First value lands at index `period`.
pub fn rsi(close: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; close.len()];
    if period == 0 || close.len() <= period {
        return out;
    }
    let changes: Vec<f64> = close.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;
    let (mut gain, mut loss) = changes[..period].iter().fold((0.0f64, 0.0f64), |(g, l), c| {
        if *c > 0.0 {
            (g + c, l)
        } else {
            (g, l - c)
        }
    });
    gain /= p;
    loss /= p;
    out[period] = rsi_value(gain, loss);
    for (i, c) in changes.iter().enumerate().skip(period) {
        gain = (gain * (p - 1.0) + c.max(0.0)) / p;
        loss = (loss * (p - 1.0) + (-c).max(0.0)) / p;
        out[i + 1] = rsi_value(gain, loss);
    }
    out
}

fn rsi_value(gain: f64, loss: f64) -> f64 {
    let total = gain + loss;
    if total == 0.0 {
        0.0
    } else {
        100.0 * gain / total
    }
}

/// Bollinger %b: position of the close between the lower and upper bands
/// (`period` SMA plus/minus `k` population deviations).
pub fn bollinger_b(close: &[f64], period: usize, k: f64) -> Vec<f64> {
    let middle = sma(close, period);
    let dev = rolling(close, period, population_std);
    close
        .iter()
        .zip(middle.iter().zip(&dev))
        .map(|(c, (m, d))| {
            let lower = m - k * d;
            let upper = m + k * d;
            ratio(c - lower, upper - lower)
        })
        .collect()
}

pub fn ultimate_oscillator(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    const PERIODS: [usize; 3] = [7, 14, 28];
    let n = close.len().min(high.len()).min(low.len());
    let mut out = vec![f64::NAN; n];
    if n <= PERIODS[2] {
        return out;
    }
    let mut bp = vec![f64::NAN; n];
    let mut tr = vec![f64::NAN; n];
    for i in 1..n {
        let true_low = low[i].min(close[i - 1]);
        let true_high = high[i].max(close[i - 1]);
        bp[i] = close[i] - true_low;
        tr[i] = true_high - true_low;
    }
    for (i, slot) in out.iter_mut().enumerate().skip(PERIODS[2]) {
        let avg = |p: usize| {
            let start = i + 1 - p;
            ratio(bp[start..=i].iter().sum(), tr[start..=i].iter().sum())
        };
        *slot = 100.0 * (4.0 * avg(PERIODS[0]) + 2.0 * avg(PERIODS[1]) + avg(PERIODS[2])) / 7.0;
    }
    out
}
