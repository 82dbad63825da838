use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use carbitrage_cluster::config::Config;

#[derive(Parser, Debug)]
#[command(name = "client", about = "Interactive client for the cluster")]
struct Args {
    /// Node id to use for discovering the cluster's static membership.
    /// Any node id works; the client only reads the default member list.
    #[arg(long, default_value_t = 217)]
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct LeaderBody {
    leader_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::default_for_node(args.seed)?;
    let client = reqwest::Client::new();

    let leader_addr = discover_leader(&client, &config)
        .await
        .context("could not find a cluster leader; is the cluster running?")?;
    println!("found leader at {leader_addr}");

    loop {
        print_menu();
        let choice = read_line("choice> ")?;
        match choice.trim() {
            "1" => run_cheapest_lookup(&client, leader_addr).await?,
            "2" => run_arbitrage_lookup(&client, leader_addr).await?,
            "q" | "quit" | "exit" => break,
            other => println!("unrecognized choice: {other}"),
        }
    }

    Ok(())
}

fn print_menu() {
    println!();
    println!("1) find the cheaper of two cities for a make/model");
    println!("2) compare price-per-distance arbitrage between two cities");
    println!("q) quit");
}

async fn discover_leader(client: &reqwest::Client, config: &Config) -> Result<SocketAddr> {
    let deadline = Duration::from_millis(500);
    for (_, addr) in config.cluster.members.iter() {
        let url = format!("http://{addr}/leader");
        let Ok(resp) = client.get(&url).timeout(deadline).send().await else { continue };
        let Ok(body) = resp.json::<LeaderBody>().await else { continue };
        if let Some(leader_id) = body.leader_id {
            if let Some(leader_addr) = config.cluster.members.get(&leader_id) {
                return Ok(*leader_addr);
            }
        }
    }
    anyhow::bail!("no reachable node reported a leader")
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}

async fn run_cheapest_lookup(client: &reqwest::Client, leader_addr: SocketAddr) -> Result<()> {
    let country = read_line("country> ")?;
    let city1 = read_line("city 1> ")?.trim().to_string();
    let city2 = read_line("city 2> ")?.trim().to_string();
    let make = read_line("make> ")?;
    let model = read_line("model> ")?;

    let body = serde_json::json!({
        "country": country.trim(),
        "city1": city1,
        "city2": city2,
        "make": make.trim(),
        "model": model.trim(),
    });

    let resp = client
        .post(format!("http://{leader_addr}/client"))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        println!("request failed: {}", resp.text().await.unwrap_or_default());
        return Ok(());
    }

    let result: serde_json::Value = resp.json().await?;
    let price1 = cheapest_price(&result["results"][city1.as_str()]);
    let price2 = cheapest_price(&result["results"][city2.as_str()]);

    match (price1, price2) {
        (Some(p1), Some(p2)) if p1 <= p2 => {
            println!("{city1} is cheaper: {p1} vs {p2}");
        }
        (Some(p1), Some(p2)) => {
            println!("{city2} is cheaper: {p2} vs {p1}");
        }
        (Some(p1), None) => println!("only {city1} has listings, cheapest is {p1}"),
        (None, Some(p2)) => println!("only {city2} has listings, cheapest is {p2}"),
        (None, None) => println!("neither city has any listings"),
    }
    Ok(())
}

fn cheapest_price(listings: &serde_json::Value) -> Option<f64> {
    listings
        .as_array()?
        .iter()
        .filter_map(|l| l["price"].as_f64())
        .fold(None, |acc, price| match acc {
            None => Some(price),
            Some(min) if price < min => Some(price),
            Some(min) => Some(min),
        })
}

async fn run_arbitrage_lookup(client: &reqwest::Client, leader_addr: SocketAddr) -> Result<()> {
    let country = read_line("country> ")?;
    let city1 = read_line("city 1> ")?.trim().to_string();
    let city2 = read_line("city 2> ")?.trim().to_string();
    let make = read_line("make> ")?;
    let model = read_line("model> ")?;

    let body = serde_json::json!({
        "country": country.trim(),
        "city1": city1,
        "city2": city2,
        "make": make.trim(),
        "model": model.trim(),
    });

    let resp = client
        .post(format!("http://{leader_addr}/arbitrage"))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        println!("request failed: {}", resp.text().await.unwrap_or_default());
        return Ok(());
    }

    let result: serde_json::Value = resp.json().await?;
    let candidate1 = &result["results"][city1.as_str()];
    let candidate2 = &result["results"][city2.as_str()];
    let ratio1 = candidate1["price_per_distance"].as_f64();
    let ratio2 = candidate2["price_per_distance"].as_f64();

    match (ratio1, ratio2) {
        (Some(r1), Some(r2)) if r1 <= r2 => print_arbitrage_winner(&city1, candidate1, r1),
        (Some(_), Some(r2)) => print_arbitrage_winner(&city2, candidate2, r2),
        (Some(r1), None) => print_arbitrage_winner(&city1, candidate1, r1),
        (None, Some(r2)) => print_arbitrage_winner(&city2, candidate2, r2),
        (None, None) => println!("neither city has a usable listing"),
    }
    Ok(())
}

fn print_arbitrage_winner(label: &str, candidate: &serde_json::Value, ratio: f64) {
    println!("best arbitrage candidate is in {label}");
    println!("price: {}", candidate["price"]);
    println!("mileage: {}", candidate["mileage"]);
    println!("location: {}", candidate["location"]);
    println!("price per distance: {ratio:.4}");
}
