// バッファ本体と、書き戻し・追い出し用のメタデータ
pub mod entity;

// トランザクションが保持するピン
pub mod handle;
