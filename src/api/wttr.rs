use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};

use crate::prelude::*;

/// Forecast day index into the wttr.in response.
#[derive(Clone, Copy, Debug)]
pub enum ForecastDay {
    Today = 0,
    Tomorrow = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("the weather lookup failed")]
    Request(#[from] reqwest::Error),

    #[error("no forecast slot for day {0}")]
    MissingSlot(usize),
}

/// Cloud-cover lookup, as the day/fallback scheduler sees it.
#[async_trait]
pub trait CloudForecast: Send + Sync {
    /// Average cloud cover in percent around midday.
    async fn cloud_cover(&self, day: ForecastDay) -> Result<u8, WeatherError>;
}

/// wttr.in client. Free, no API key, three-hourly slots over three days.
pub struct Wttr {
    client: reqwest::Client,
    url: String,
    retries: u32,
    retry_delay: Duration,
}

/// Three-hourly slot indices averaged into the daily figure:
/// 09:00, 12:00 and 15:00 UTC.
const MIDDAY_SLOTS: [usize; 3] = [3, 4, 5];

impl Wttr {
    pub fn new(location: &str, retries: u32, retry_delay: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
            url: format!("https://wttr.in/{location}?format=j1"),
            retries: retries.max(1),
            retry_delay,
        })
    }

    async fn fetch(&self, day: ForecastDay) -> Result<u8, WeatherError> {
        let forecast: Forecast =
            self.client.get(&self.url).send().await?.error_for_status()?.json().await?;
        let day = day as usize;
        let hourly =
            &forecast.weather.get(day).ok_or(WeatherError::MissingSlot(day))?.hourly;
        let mut total = 0_u32;
        for slot in MIDDAY_SLOTS {
            let cover = hourly.get(slot).ok_or(WeatherError::MissingSlot(day))?.cloud_cover;
            debug!(slot, cover, "cloud cover");
            total += cover;
        }
        Ok((total / MIDDAY_SLOTS.len() as u32).min(100) as u8)
    }
}

#[async_trait]
impl CloudForecast for Wttr {
    #[instrument(skip_all, fields(day = ?day))]
    async fn cloud_cover(&self, day: ForecastDay) -> Result<u8, WeatherError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch(day).await {
                Ok(cover) => return Ok(cover),
                // A well-formed response without our slot will not grow one on retry:
                Err(error @ WeatherError::MissingSlot(_)) => return Err(error),
                Err(error) if attempt < self.retries => {
                    warn!(attempt, %error, "the lookup failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[derive(Deserialize)]
struct Forecast {
    weather: Vec<DailyForecast>,
}

#[derive(Deserialize)]
struct DailyForecast {
    hourly: Vec<HourlyForecast>,
}

#[serde_as]
#[derive(Deserialize)]
struct HourlyForecast {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(rename = "cloudcover")]
    cloud_cover: u32,
}
