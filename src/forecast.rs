// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Water Usage Forecasts
//!
//! Default `Executor` of the service. A request carries the yearly water usage
//! of a consecutive range of years; the response extends it by
//! `predictedYears` using one of three least-squares models:
//!
//! - `linear`: `y = a * x + b`
//! - `polynomial`: `y = a * x^2 + b * x + c`
//! - `logarithmic`: `y = a * log(x) + b`

use crate::{errors::ExecutorError, executor::Executor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

const DEFAULT_PREDICTED_YEARS: u32 = 15;

/// Upper bound of `predictedYears`.
pub const MAX_PREDICTED_YEARS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastType {
    Linear,
    Polynomial,
    Logarithmic,
}

/// Usage amounts of the years `start_year..=end_year`, one entry per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterUsages {
    pub start_year: i32,
    pub end_year: i32,
    pub usage_amounts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRequest {
    pub forecast_type: ForecastType,
    #[serde(default = "default_predicted_years")]
    pub predicted_years: u32,
    pub usage_data: WaterUsages,
}

fn default_predicted_years() -> u32 {
    DEFAULT_PREDICTED_YEARS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastResponse {
    pub forecast_type: ForecastType,
    pub forecast_equation: String,
    /// R² of the model against the reference usages.
    pub forecast_score: f64,
    pub forecasted_usages: WaterUsages,
    pub reference_usages: WaterUsages,
}

impl ForecastRequest {
    /// Checks that the usage data describes every year of its range exactly once.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        let data = &self.usage_data;
        if data.start_year == data.end_year {
            return Err(ExecutorError::InvalidRequest(
                "Unable to run successful forecast with one set of data".to_owned(),
            ));
        }

        if data.end_year < data.start_year {
            return Err(ExecutorError::InvalidRequest(
                "The end year lies before the start year".to_owned(),
            ));
        }

        let needed = i64::from(data.end_year) - i64::from(data.start_year) + 1;
        if data.usage_amounts.len() as i64 != needed {
            return Err(ExecutorError::InvalidRequest(format!(
                "The usage values have {} entries. Expected {} from start and end parameter",
                data.usage_amounts.len(),
                needed
            )));
        }

        if !(1..=MAX_PREDICTED_YEARS).contains(&self.predicted_years) {
            return Err(ExecutorError::InvalidRequest(format!(
                "The number of predicted years must be between 1 and {}, got {}",
                MAX_PREDICTED_YEARS, self.predicted_years
            )));
        }

        if self.forecast_type == ForecastType::Logarithmic && data.start_year <= 0 {
            return Err(ExecutorError::InvalidRequest(
                "A logarithmic forecast needs positive years".to_owned(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ForecastExecutor;

impl ForecastExecutor {
    pub fn forecast(&self, request: &ForecastRequest) -> Result<ForecastResponse, ExecutorError> {
        request.validate()?;

        let data = &request.usage_data;
        let years: Vec<f64> = (data.start_year..=data.end_year).map(f64::from).collect();
        let out_of_range = || {
            ExecutorError::InvalidRequest("The forecast range exceeds the supported years".to_owned())
        };
        let first_forecast_year = data.end_year.checked_add(1).ok_or_else(out_of_range)?;
        let last_forecast_year = i32::try_from(request.predicted_years)
            .ok()
            .and_then(|years| data.end_year.checked_add(years))
            .ok_or_else(out_of_range)?;
        let forecast_years: Vec<f64> = (first_forecast_year..=last_forecast_year)
            .map(f64::from)
            .collect();

        info!(
            forecast_type = ?request.forecast_type,
            years = years.len(),
            predicted_years = request.predicted_years,
            "running forecast"
        );

        let (model, equation): (Box<dyn Fn(f64) -> f64>, String) = match request.forecast_type {
            ForecastType::Linear => {
                let curve = Polynomial::fit(&years, &data.usage_amounts, 1)?;
                let c = curve.expanded();
                let equation = format!("y = {} * x + {}", c[1], c[0]);
                (Box::new(move |x| curve.eval(x)), equation)
            }
            ForecastType::Polynomial => {
                let curve = Polynomial::fit(&years, &data.usage_amounts, 2)?;
                let c = curve.expanded();
                let equation = format!("y = {} * x^2 + {} * x + {}", c[2], c[1], c[0]);
                (Box::new(move |x| curve.eval(x)), equation)
            }
            ForecastType::Logarithmic => {
                let log_years: Vec<f64> = years.iter().map(|x| x.ln()).collect();
                let curve = Polynomial::fit(&log_years, &data.usage_amounts, 1)?;
                let c = curve.expanded();
                let equation = format!("y = {} * log(x) + {}", c[1], c[0]);
                (Box::new(move |x: f64| curve.eval(x.ln())), equation)
            }
        };

        let predicted: Vec<f64> = years.iter().map(|&x| model(x)).collect();
        let forecasted: Vec<f64> = forecast_years.iter().map(|&x| model(x)).collect();

        Ok(ForecastResponse {
            forecast_type: request.forecast_type,
            forecast_equation: equation,
            forecast_score: r2_score(&data.usage_amounts, &predicted),
            forecasted_usages: WaterUsages {
                start_year: first_forecast_year,
                end_year: last_forecast_year,
                usage_amounts: forecasted,
            },
            reference_usages: data.clone(),
        })
    }
}

impl Executor for ForecastExecutor {
    fn execute(&self, request: Value) -> Result<Value, ExecutorError> {
        let request: ForecastRequest = serde_json::from_value(request)
            .map_err(|err| ExecutorError::InvalidRequest(err.to_string()))?;

        let response = self.forecast(&request)?;

        serde_json::to_value(response).map_err(|err| ExecutorError::Computation(err.to_string()))
    }
}

/// Least-squares polynomial around the mean of its inputs, which keeps the
/// normal equations well conditioned for year-sized x values.
#[derive(Debug, Clone)]
struct Polynomial {
    center: f64,
    coefficients: Vec<f64>,
}

impl Polynomial {
    fn fit(xs: &[f64], ys: &[f64], degree: usize) -> Result<Polynomial, ExecutorError> {
        if xs.len() <= degree {
            return Err(ExecutorError::Computation(format!(
                "At least {} values are needed for a forecast of degree {}",
                degree + 1,
                degree
            )));
        }

        let center = xs.iter().sum::<f64>() / xs.len() as f64;
        let n = degree + 1;

        // augmented normal equations: (VᵀV | Vᵀy)
        let mut matrix = vec![vec![0.0; n + 1]; n];
        for (&x, &y) in xs.iter().zip(ys) {
            let t = x - center;
            for row in 0..n {
                for col in 0..n {
                    matrix[row][col] += t.powi((row + col) as i32);
                }
                matrix[row][n] += t.powi(row as i32) * y;
            }
        }

        let coefficients = solve(matrix).ok_or_else(|| {
            ExecutorError::Computation("The usage data does not allow a unique fit".to_owned())
        })?;

        Ok(Polynomial {
            center,
            coefficients,
        })
    }

    fn eval(&self, x: f64) -> f64 {
        let t = x - self.center;
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * t + c)
    }

    /// Coefficients in powers of `x` instead of `x - center`, lowest first.
    fn expanded(&self) -> Vec<f64> {
        let mut result = vec![0.0; self.coefficients.len()];
        for &c in self.coefficients.iter().rev() {
            // result = result * (x - center) + c
            let mut next = vec![0.0; result.len()];
            for (power, &value) in result.iter().enumerate() {
                if power + 1 < next.len() {
                    next[power + 1] += value;
                }
                next[power] -= value * self.center;
            }
            next[0] += c;
            result = next;
        }
        result
    }
}

/// Gauss-Jordan elimination with partial pivoting on an augmented matrix.
fn solve(mut matrix: Vec<Vec<f64>>) -> Option<Vec<f64>> {
    let n = matrix.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| {
            matrix[a][col]
                .abs()
                .partial_cmp(&matrix[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);

        for row in 0..n {
            if row != col {
                let factor = matrix[row][col] / matrix[col][col];
                for k in col..=n {
                    matrix[row][k] -= factor * matrix[col][k];
                }
            }
        }
    }

    Some((0..n).map(|i| matrix[i][n] / matrix[i][i]).collect())
}

/// Coefficient of determination, 1.0 for a perfect fit of constant data.
fn r2_score(actual: &[f64], predicted: &[f64]) -> f64 {
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let residual: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    let total: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();

    if total == 0.0 {
        return if residual == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - residual / total
}
