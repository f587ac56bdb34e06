use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::engine::history::SessionHistory;
use crate::error::MakerError;
use crate::types::SessionResult;

const RESULT_HEADER: &str =
    "timestamp;mercado;token_seguido;modo_real;pnl_final;inventario_final;cash_final;kappa_calibrada";

/// Append one semicolon-delimited result row to the accumulated results
/// file, writing the header only when the file is created.
pub fn append_result(data_dir: &str, result: &SessionResult) -> Result<(), MakerError> {
    let dir = format!("{data_dir}/simulacion");
    fs::create_dir_all(&dir)?;
    let path = format!("{dir}/resultados_manuales.csv");

    let fresh = !Path::new(&path).exists();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if fresh {
        writeln!(file, "{RESULT_HEADER}")?;
    }
    writeln!(
        file,
        "{};{};{};{};{:.5};{};{:.5};{:.4}",
        result.timestamp,
        result.market,
        result.token,
        result.real_mode,
        result.pnl_final,
        result.inventory_final,
        result.cash_final,
        result.kappa_calibrated,
    )?;
    Ok(())
}

/// Dump the full tick history as a per-session CSV snapshot. Pure sink
/// over the immutable history view; runs once, at shutdown.
pub fn write_history(
    data_dir: &str,
    kappa: f64,
    history: &SessionHistory,
) -> Result<String, MakerError> {
    let dir = format!("{data_dir}/history");
    fs::create_dir_all(&dir)?;
    let tag = format!("K{:.2}_{}", kappa, chrono::Local::now().format("%H%M%S"));
    let path = format!("{dir}/sesion_{tag}.csv");

    let mut file = fs::File::create(&path)?;
    writeln!(
        file,
        "tick,wmp,fair,reservation,bid,ask,inventory,pnl,gamma,sigma,q,r,kappa"
    )?;
    for i in 0..history.len() {
        writeln!(
            file,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.4}",
            i,
            history.wmp[i],
            history.fair[i],
            history.reservation[i],
            history.our_bid[i],
            history.our_ask[i],
            history.inventory[i],
            history.pnl[i],
            history.gamma[i],
            history.sigma[i],
            history.q_price[i],
            history.r_price[i],
            history.kappa[i],
        )?;
    }
    file.flush()?;
    Ok(path)
}
