// ブロック ID と ブロックイメージ
pub mod entity;

// ディスク層 (serializer) とのインターフェース
pub mod manager;

// 完了タイミングを制御できるインメモリ実装
pub mod memory;

// ファイルを使った実装
pub mod disk;
