use axum::Router;
use tokio::net::TcpListener;

pub const SNAPSHOT_CSV: &str = "Rank,Club,Country,Level,Elo,From,To\n\
    1,Alpha,X,1,2000.0,2024-01-01,2024-01-01\n\
    2,Beta,X,1,1950.5,2024-01-01,2024-01-01\n";

pub const FIXTURES_CSV: &str = "Date,Country,Competition,Home,Away,HomeLevel,AwayLevel,HomeElo,AwayElo,HomeWin,Draw,AwayWin\n\
    2024-03-02,X,League,Alpha,Beta,1,1,2000.0,1950.5,0.50,0.27,0.23\n\
    2024-03-02,X,League,Gamma,Delta,2,2,1500.0,1480.0,0.45,0.28,0.27\n";

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_http(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
