//! # Wallet and task loaders
//!
//! Both files come as CSV (header row) or YAML (a list of mappings, or a
//! mapping holding that list under `wallets` / `tasks`). Each row becomes a
//! string record so the two formats share one validation path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::error::{BotError, BotResult};
use crate::models::task::{normalize_autosell, normalize_slippage, DEFAULT_AUTOSELL_PERCENT, DEFAULT_SLIPPAGE_PERCENT};
use crate::models::{Task, TaskStore, Wallet, WalletStore};

pub const WALLET_FILES: [&str; 3] = ["wallets.csv", "wallets.yaml", "wallets.yml"];
pub const TASK_FILES: [&str; 3] = ["tasks.csv", "tasks.yaml", "tasks.yml"];

/// Column name to raw value
pub type Record = HashMap<String, String>;

pub fn load_wallets(dir: &Path) -> Result<WalletStore> {
    let path = locate(dir, &WALLET_FILES)?;
    let records = read_records(&path, "wallets")?;
    let wallets = wallets_from_records(&records);
    if wallets.is_empty() {
        bail!("no valid wallets in {}", path.display());
    }
    info!("👛 Loaded {} wallet(s) from {}", wallets.len(), path.display());
    Ok(wallets)
}

pub fn load_tasks(dir: &Path) -> Result<TaskStore> {
    let path = locate(dir, &TASK_FILES)?;
    let records = read_records(&path, "tasks")?;
    let tasks = tasks_from_records(&records);
    if tasks.is_empty() {
        bail!("no valid tasks in {}", path.display());
    }
    info!("📋 Loaded {} task(s) from {}", tasks.len(), path.display());
    Ok(TaskStore::new(tasks))
}

fn locate(dir: &Path, names: &[&str]) -> Result<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .with_context(|| format!("none of {} found in {}", names.join(", "), dir.display()))
}

fn read_records(path: &Path, key: &str) -> Result<Vec<Record>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if path.extension().and_then(|ext| ext.to_str()) == Some("csv") {
        Ok(parse_csv(&text))
    } else {
        parse_yaml_records(&text, key).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Header-driven CSV; blank lines and `#` comments are ignored
pub fn parse_csv(text: &str) -> Vec<Record> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<String> = split_csv_line(header)
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();

    lines
        .map(|line| {
            let values = split_csv_line(line);
            columns
                .iter()
                .enumerate()
                .map(|(i, column)| (column.clone(), values.get(i).cloned().unwrap_or_default()))
                .collect()
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

pub fn parse_yaml_records(text: &str, key: &str) -> Result<Vec<Record>> {
    let root: Value = serde_yaml::from_str(text)?;
    let items = match root {
        Value::Sequence(items) => items,
        Value::Mapping(mut map) => match map.remove(key) {
            Some(Value::Sequence(items)) => items,
            _ => bail!("expected a list under '{}'", key),
        },
        Value::Null => Vec::new(),
        _ => bail!("expected a list of {}", key),
    };

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let Value::Mapping(map) = item else {
            warn!("skipping {} entry {}: not a mapping", key, i + 1);
            continue;
        };
        let record = map
            .into_iter()
            .filter_map(|(k, v)| Some((scalar(k)?.to_ascii_lowercase(), scalar(v).unwrap_or_default())))
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn scalar(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field<'a>(record: &'a Record, name: &str) -> &'a str {
    record.get(name).map(String::as_str).unwrap_or_default().trim()
}

fn required<'a>(record: &'a Record, name: &str) -> BotResult<&'a str> {
    match field(record, name) {
        "" => Err(BotError::Validation(format!("{} is required", name))),
        value => Ok(value),
    }
}

fn parse_or<T: std::str::FromStr>(record: &Record, name: &str, default: T) -> BotResult<T> {
    match field(record, name) {
        "" => Ok(default),
        raw => raw
            .parse()
            .map_err(|_| BotError::Validation(format!("invalid {} '{}'", name, raw))),
    }
}

/// Invalid keys are skipped, duplicate names overwrite
pub fn wallets_from_records(records: &[Record]) -> WalletStore {
    let mut store = WalletStore::new();
    for (i, record) in records.iter().enumerate() {
        let wallet = required(record, "name")
            .and_then(|name| Wallet::from_base58(name, required(record, "private_key")?));
        match wallet {
            Ok(wallet) => store.insert(wallet),
            Err(e) => warn!("⚠️ Skipping wallet row {}: {}", i + 1, e),
        }
    }
    store
}

/// Valid rows become tasks numbered from 1 in file order
pub fn tasks_from_records(records: &[Record]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let id = tasks.len() as u64 + 1;
        match task_from_record(id, record) {
            Ok(task) => tasks.push(task),
            Err(e) => warn!("⚠️ Skipping task row {}: {}", i + 1, e),
        }
    }
    tasks
}

fn task_from_record(id: u64, record: &Record) -> BotResult<Task> {
    let name = match field(record, "task_name") {
        "" => format!("task-{}", id),
        name => name.to_string(),
    };

    let task = Task {
        id,
        module: required(record, "module")?.parse()?,
        wallet: required(record, "wallet")?.to_string(),
        operation: required(record, "operation")?.parse()?,
        amount_sol: parse_or(record, "amount_sol", 0.0)?,
        slippage_percent: normalize_slippage(parse_or(record, "slippage_percent", DEFAULT_SLIPPAGE_PERCENT)?),
        priority_fee: field(record, "priority_fee").parse()?,
        compute_units: parse_or(record, "compute_units", 0)?,
        autosell_percent: normalize_autosell(parse_or(record, "percent_to_sell", DEFAULT_AUTOSELL_PERCENT as i64)?),
        token_mint: required(record, "token_mint")?.to_string(),
        created_at: Utc::now(),
        name,
    };
    task.validate()?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DexModule, Operation, PriorityFee};
    use solana_sdk::signature::{Keypair, Signer};

    const MINT: &str = "So11111111111111111111111111111111111111112";

    #[test]
    fn test_csv_quoted_fields() {
        let records = parse_csv("a,b,c\n\"x, y\",\"say \"\"hi\"\"\",z\n\n# comment\n1,2\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["a"], "x, y");
        assert_eq!(records[0]["b"], "say \"hi\"");
        assert_eq!(records[1]["c"], "");
    }

    #[test]
    fn test_tasks_csv_clamps_and_skips() {
        let csv = format!(
            "task_name,module,wallet,operation,amount_sol,slippage_percent,priority_fee,token_mint,compute_units,percent_to_sell\n\
             first,pumpfun,main,snipe,0.1,150,0.0001,{mint},200000,50\n\
             broken,uniswap,main,snipe,0.1,5,default,{mint},,\n\
             second,raydium,main,swap,0.2,0.2,default,{mint},,0\n\
             nomint,smart,main,swap,0.2,5,default,not-a-mint,,\n",
            mint = MINT
        );
        let tasks = tasks_from_records(&parse_csv(&csv));
        assert_eq!(tasks.len(), 2);

        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].module, DexModule::PumpFun);
        assert_eq!(tasks[0].slippage_percent, 1.0);
        assert_eq!(tasks[0].priority_fee, PriorityFee::Sol(0.0001));
        assert_eq!(tasks[0].compute_units, 200_000);
        assert_eq!(tasks[0].autosell_percent, 50);

        assert_eq!(tasks[1].id, 2);
        assert_eq!(tasks[1].name, "second");
        assert_eq!(tasks[1].operation, Operation::Swap);
        assert_eq!(tasks[1].slippage_percent, 1.0);
        assert_eq!(tasks[1].autosell_percent, 99);
    }

    #[test]
    fn test_buy_without_amount_rejected() {
        let csv = format!("module,wallet,operation,token_mint\npumpfun,main,snipe,{}\npumpfun,main,sell,{}\n", MINT, MINT);
        let tasks = tasks_from_records(&parse_csv(&csv));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].operation, Operation::Sell);
        assert_eq!(tasks[0].name, "task-1");
    }

    #[test]
    fn test_tasks_yaml() {
        let yaml = format!(
            "tasks:\n  - task_name: y1\n    module: smart\n    wallet: main\n    operation: swap\n    amount_sol: 0.5\n    slippage_percent: 12.5\n    token_mint: {}\n    percent_to_sell: 75\n",
            MINT
        );
        let tasks = tasks_from_records(&parse_yaml_records(&yaml, "tasks").unwrap());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].amount_sol, 0.5);
        assert_eq!(tasks[0].slippage_percent, 12.5);
        assert_eq!(tasks[0].autosell_percent, 75);
        assert_eq!(tasks[0].priority_fee, PriorityFee::Default);
    }

    #[test]
    fn test_wallets_skip_invalid_and_overwrite_duplicates() {
        let first = Keypair::new();
        let second = Keypair::new();
        let csv = format!(
            "name,private_key\nmain,{}\nbad,not-base58-0OIl\nmain,{}\n",
            bs58::encode(first.to_bytes()).into_string(),
            bs58::encode(second.to_bytes()).into_string()
        );
        let wallets = wallets_from_records(&parse_csv(&csv));
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets.get("main").unwrap().pubkey(), second.pubkey());
    }

    #[test]
    fn test_load_tasks_requires_one_valid() {
        let dir = std::env::temp_dir().join(format!("loader-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tasks.yaml"), "- module: nowhere\n").unwrap();
        assert!(load_tasks(&dir).is_err());

        fs::remove_file(dir.join("tasks.yaml")).unwrap();
        assert!(load_tasks(&dir).unwrap_err().to_string().contains("tasks.csv"));
        let _ = fs::remove_dir_all(&dir);
    }
}
