use std::time::Duration;

use barrage::{
    macros::weighted,
    metric::Observation,
    metrics::{CHECKS, HTTP_REQS, HTTP_REQ_DURATION},
    report::StdoutReporter,
    Reporter, Scenario, Stage, StageExecutor, StageSchedule, ThinkTime, Threshold, VuContext,
    Weighted, WeightedTable,
};
use reqwest::Client;
use tokio::time::Instant;

#[weighted]
enum Page {
    #[weight(0.7)]
    Home,
    #[weight(0.2)]
    Search,
    #[weight(0.1)]
    Checkout,
}

impl Page {
    fn path(self) -> &'static str {
        match self {
            Page::Home => "/",
            Page::Search => "/search?q=rust",
            Page::Checkout => "/checkout",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("barrage=info").init();

    // NEVER instantiate heavy things like clients inside the action
    // unless you want to kill performance
    let client = Client::new();
    let pages = WeightedTable::<Page>::from_weighted()?;

    let scenario = Scenario::builder()
        .name("Http scenario")
        .action(move |mut ctx: VuContext| {
            let client = client.clone();
            let page = *pages.choose(&mut ctx.rng);
            async move {
                let start = Instant::now();
                let res = client
                    .get(format!("http://localhost:3000{}", page.path()))
                    .send()
                    .await;
                let success = matches!(res, Ok(r) if r.status().is_success());
                let latency = start.elapsed().as_secs_f64() * 1000.0;

                let page = format!("{page:?}");
                let record = |o: Observation| {
                    let _ = ctx.metrics.record(o.with_tag("page", page.as_str()));
                };
                record(Observation::new(HTTP_REQS, 1.0));
                record(Observation::new(HTTP_REQ_DURATION, latency));
                record(Observation::new(CHECKS, success));
                None
            }
        })
        .think_time(ThinkTime::uniform(
            Duration::from_millis(200),
            Duration::from_millis(800),
        )?)
        .thresholds(vec![
            Threshold::parse(HTTP_REQ_DURATION, "p(95)<300")?,
            Threshold::parse("http_req_duration{page:Checkout}", "max<1000")?,
            Threshold::parse(CHECKS, "rate>0.99")?.abort_on_fail(Duration::from_secs(5)),
        ])
        .seed(Some(7))
        .build();

    // Ramp up to 20 VUs, hold, then a short spike to 50 and back down
    let executor = StageExecutor::builder()
        .schedule(StageSchedule::new(vec![
            Stage::new(Duration::from_secs(10), 20),
            Stage::new(Duration::from_secs(20), 20),
            Stage::new(Duration::ZERO, 50),
            Stage::new(Duration::from_secs(5), 50),
            Stage::new(Duration::from_secs(5), 0),
        ])?)
        .graceful_stop(Duration::from_secs(5))
        .build();

    let result = scenario.run(&executor).await?;
    StdoutReporter::default().report(&result).await?;
    Ok(())
}
