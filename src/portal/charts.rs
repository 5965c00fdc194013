use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::portal::models::Measurement;

/// Only the most recent measurements are plotted.
pub const CHART_WINDOW: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub label: String,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub title: String,
    pub series: Vec<ChartSeries>,
}

/// Calendar date of an upstream timestamp (ISO-8601, with or without offset).
pub fn measured_on(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn series<F>(label: &str, measurements: &[Measurement], pick: F) -> ChartSeries
where
    F: Fn(&Measurement) -> Option<f64>,
{
    let points = measurements
        .iter()
        .take(CHART_WINDOW)
        .filter_map(|m| {
            let value = pick(m)?;
            let date = measured_on(m.measured_at.as_deref()?)?;
            Some(ChartPoint { date, value })
        })
        .collect();
    ChartSeries {
        label: label.to_string(),
        points,
    }
}

fn chart(title: &str, series: Vec<ChartSeries>) -> Option<Chart> {
    if series.is_empty() || series.iter().any(|s| s.points.is_empty()) {
        return None;
    }
    Some(Chart {
        title: title.to_string(),
        series,
    })
}

/// Glucose trend for the patient's own measurements page.
pub fn glucose_chart(measurements: &[Measurement]) -> Option<Chart> {
    chart(
        "Glucose",
        vec![series("Glucose (mmol/L)", measurements, |m| m.glucose)],
    )
}

/// The four panels of the doctor's patient card. Panels without data are left out.
pub fn patient_card_charts(measurements: &[Measurement]) -> Vec<Chart> {
    [
        chart("Glucose", vec![series("Glucose", measurements, |m| m.glucose)]),
        chart(
            "Blood pressure",
            vec![
                series("Systolic", measurements, |m| m.systolic_bp.map(f64::from)),
                series("Diastolic", measurements, |m| m.diastolic_bp.map(f64::from)),
            ],
        ),
        chart(
            "Pulse",
            vec![series("Pulse", measurements, |m| m.pulse.map(f64::from))],
        ),
        chart("Weight", vec![series("Weight", measurements, |m| m.weight)]),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(day: u32, glucose: Option<f64>, pulse: Option<i32>) -> Measurement {
        Measurement {
            glucose,
            pulse,
            measured_at: Some(format!("2024-03-{day:02}T09:15:00")),
            ..Measurement::default()
        }
    }

    #[test]
    fn timestamp_formats() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(measured_on("2024-03-05T09:15:00"), Some(day));
        assert_eq!(measured_on("2024-03-05T09:15:00.123456"), Some(day));
        assert_eq!(measured_on("2024-03-05T09:15:00+03:00"), Some(day));
        assert_eq!(measured_on("2024-03-05"), Some(day));
        assert_eq!(measured_on("yesterday"), None);
    }

    #[test]
    fn no_measurements_no_chart() {
        assert!(glucose_chart(&[]).is_none());
        assert!(patient_card_charts(&[]).is_empty());
    }

    #[test]
    fn glucose_chart_skips_missing_values() {
        let data = vec![
            reading(1, Some(5.1), None),
            reading(2, None, Some(70)),
            reading(3, Some(6.0), Some(72)),
        ];
        let chart = glucose_chart(&data).unwrap();
        assert_eq!(chart.series.len(), 1);
        assert_eq!(chart.series[0].points.len(), 2);
        assert_eq!(chart.series[0].points[1].value, 6.0);
    }

    #[test]
    fn window_limits_points() {
        let data: Vec<_> = (0..40).map(|i| reading(1 + i % 28, Some(5.0), None)).collect();
        let chart = glucose_chart(&data).unwrap();
        assert_eq!(chart.series[0].points.len(), CHART_WINDOW);
    }

    #[test]
    fn card_panels_only_with_data() {
        let data = vec![reading(1, Some(5.1), Some(70)), reading(2, None, Some(68))];
        let charts = patient_card_charts(&data);
        let titles: Vec<_> = charts.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Glucose", "Pulse"]);
    }
}
