use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{ClientConfig, MessagingClient, PendingIntent, SessionIdentity};
use shared::domain::{BookingId, CompanyId, RoomId, UserId, UserRole};
use shared::protocol::NotificationQuery;

mod config;

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Rooms,
    Watch {
        #[arg(long)]
        room: Option<String>,
    },
    Send {
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        booking: Option<String>,
        body: String,
    },
    Notifications {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        unread_only: bool,
    },
    MarkAllRead,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let settings = config::load_settings();

    let identity = match config::parse_role(&settings.role)? {
        UserRole::Customer => SessionIdentity::customer(UserId::new(settings.user_id.clone())),
        UserRole::Company => {
            let Some(company_id) = settings.company_id.clone() else {
                anyhow::bail!(
                    "role 'company' needs company_id in console.toml or CONSOLE_COMPANY_ID"
                );
            };
            SessionIdentity::company(
                UserId::new(settings.user_id.clone()),
                CompanyId::new(company_id),
            )
        }
    };
    let client = MessagingClient::new(&settings.server_url, identity, ClientConfig::default())?;

    match cli.command {
        Command::Rooms => {
            let rooms = client.refresh_rooms().await?;
            for room in &rooms {
                match &room.booking_id {
                    Some(booking_id) => println!(
                        "{} customer={} company={} booking={}",
                        room.room_id, room.customer_id, room.company_id, booking_id
                    ),
                    None => println!(
                        "{} customer={} company={}",
                        room.room_id, room.customer_id, room.company_id
                    ),
                }
            }
            println!("{} room(s)", rooms.len());
        }
        Command::Watch { room } => {
            let mut events = client.subscribe_events();
            client.connect().await?;
            if let Some(room) = room {
                let messages = client.open_room(&RoomId::new(room)).await?;
                for message in &messages {
                    println!(
                        "{} {}: {}",
                        message.created_at, message.sender_id, message.body
                    );
                }
            }
            println!("watching, ctrl-c to stop");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => println!("{event:?}"),
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Send {
            room,
            customer,
            company,
            booking,
            body,
        } => {
            match room {
                Some(room_id) => {
                    client.open_room(&RoomId::new(room_id)).await?;
                }
                None => {
                    client
                        .start_conversation(PendingIntent {
                            customer_id: customer.map(UserId::new),
                            company_id: company.map(CompanyId::new),
                            booking_id: booking.map(BookingId::new),
                        })
                        .await?;
                }
            }
            client.send(&body).await?;
            println!("sent");
        }
        Command::Notifications {
            page,
            limit,
            unread_only,
        } => {
            let items = client
                .refresh_notifications(NotificationQuery {
                    page,
                    limit,
                    unread_only,
                    kind: None,
                })
                .await?;
            let unread = client.refresh_unread().await?;
            for item in &items {
                let marker = if item.read { ' ' } else { '*' };
                println!(
                    "{marker} {} [{:?}] {}: {}",
                    item.created_at, item.kind, item.title, item.body
                );
            }
            println!("{} notification(s), {unread} unread", items.len());
        }
        Command::MarkAllRead => {
            client.mark_all_notifications_read().await?;
            println!("all notifications marked read");
        }
    }

    client.close().await;
    Ok(())
}
