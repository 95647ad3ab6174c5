use tch::{Device, Kind, Tensor};
use tokenizer::BPE;

/// Label positions the loss must skip.
pub const IGNORE_INDEX: i64 = -100;

/// Tokenizes `texts` (each truncated to `max_len` with a trailing EOS) and
/// right-pads them into `(input_ids, attention_mask)`, both [batch, longest].
pub fn encode_sources(tokenizer: &BPE, texts: &[String], max_len: usize, device: Device) -> (Tensor, Tensor) {
    let rows: Vec<Vec<u32>> = texts
        .iter()
        .map(|text| tokenizer.encode_with_max_tokens(text, max_len))
        .collect();
    let ids = pad_rows(&rows, tokenizer.pad_id() as i64, device);
    let mask = ids.ne(tokenizer.pad_id() as i64).to_kind(Kind::Int64);
    (ids, mask)
}

/// Tokenizes target texts into label ids padded with [`IGNORE_INDEX`].
pub fn encode_targets(tokenizer: &BPE, texts: &[String], max_len: usize, device: Device) -> Tensor {
    let rows: Vec<Vec<u32>> = texts
        .iter()
        .map(|text| tokenizer.encode_with_max_tokens(text, max_len))
        .collect();
    pad_rows(&rows, IGNORE_INDEX, device)
}

fn pad_rows(rows: &[Vec<u32>], fill: i64, device: Device) -> Tensor {
    let longest = rows.iter().map(Vec::len).max().unwrap_or(1).max(1);
    let mut flat = Vec::with_capacity(rows.len() * longest);
    for row in rows {
        flat.extend(row.iter().map(|&id| id as i64));
        flat.extend(std::iter::repeat(fill).take(longest - row.len()));
    }
    Tensor::from_slice(&flat)
        .view([rows.len() as i64, longest as i64])
        .to(device)
}
