use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::chain::HolderSnapshot;

/// Write one timestamped holders CSV under `dir`, returning the file path.
pub fn write_holders_snapshot(dir: &Path, snapshot: &HolderSnapshot) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "holders-{}.csv",
        snapshot.updated_at.format("%Y%m%d-%H%M%S")
    ));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["address", "alpha_raw", "tao_raw", "alpha", "tao"])?;
    let mut rows: Vec<_> = snapshot.balances.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    for (address, balance) in rows {
        writer.write_record([
            address.clone(),
            balance.alpha_raw.to_string(),
            balance.tao_raw.to_string(),
            format!("{:.9}", balance.alpha()),
            format!("{:.9}", balance.tao()),
        ])?;
    }
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::chain::holders::{HolderBalance, HolderSnapshot};

    use super::write_holders_snapshot;

    #[test]
    fn writes_sorted_rows() {
        let mut balances = HashMap::new();
        balances.insert(
            "5VoterB".to_string(),
            HolderBalance {
                alpha_raw: 2_000_000_000,
                tao_raw: 0,
            },
        );
        balances.insert(
            "5VoterA".to_string(),
            HolderBalance {
                alpha_raw: 1_000_000_000,
                tao_raw: 500_000_000,
            },
        );
        let snapshot = HolderSnapshot::new(balances);

        let dir = std::env::temp_dir().join("emission-oracle-csv-test");
        let path = write_holders_snapshot(&dir, &snapshot).expect("write");
        let data = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines[0], "address,alpha_raw,tao_raw,alpha,tao");
        assert!(lines[1].starts_with("5VoterA,1000000000,500000000,1.0"));
        assert!(lines[2].starts_with("5VoterB,2000000000,0,2.0"));
        std::fs::remove_file(path).ok();
    }
}
