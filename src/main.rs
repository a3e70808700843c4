//! Turtle - 多智能体编排引擎
//!
//! 入口：初始化日志、按配置构建编排器，并运行终端对话循环。
//! 命令：/new 开始新会话，/history 查看当前会话，/quit 退出。

use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use turtle::config::load_config;
use turtle::core::{Orchestrator, OrchestratorBuilder};
use turtle::memory::Role;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    turtle::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let app_name = cfg.app.name.clone();
    let orchestrator = OrchestratorBuilder::new(cfg)
        .build()
        .await
        .context("Failed to build orchestrator")?;

    println!(
        "{} ready. Handlers: {}. Type /new, /history or /quit.",
        app_name,
        orchestrator.registry().names().join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut thread_id: Option<String> = None;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                thread_id = None;
                println!("Started a new conversation.");
                continue;
            }
            "/history" => {
                print_history(&orchestrator, thread_id.as_deref()).await;
                continue;
            }
            _ => {}
        }

        match orchestrator.handle_turn(input, thread_id.as_deref()).await {
            Ok(outcome) => {
                println!("{}", outcome.response);
                thread_id = Some(outcome.thread_id);
            }
            Err(e) if e.is_retryable() => println!("[temporarily unavailable, try again] {}", e),
            Err(e) => println!("[error] {}", e),
        }
    }

    Ok(())
}

async fn print_history(orchestrator: &Orchestrator, thread_id: Option<&str>) {
    let Some(id) = thread_id else {
        println!("No conversation yet.");
        return;
    };
    match orchestrator.thread(id).await {
        Ok(thread) => {
            println!("Thread {}", thread.id);
            for m in &thread.messages {
                let who = match (m.role, m.origin.as_deref()) {
                    (Role::HandlerResult, Some(origin)) => origin.to_string(),
                    (role, _) => role.to_string(),
                };
                println!("  #{} [{}] {}", m.sequence, who, m.content);
            }
        }
        Err(e) => println!("[error] {}", e),
    }
}
